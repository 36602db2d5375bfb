//! Remote/process-wide tier.
//!
//! Interchangeable with the disk tier apart from latency: the orchestrator
//! consults it per configuration toggles and treats every failure as a miss
//! unless strict mode. No network implementation ships in-tree; the trait
//! plus the counting in-memory double define the contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

/// Minimal key/value contract a remote service must offer.
pub trait RemoteCacheBackend: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;
}

/// Typed view over a backend, scoped to one namespace.
#[derive(Clone)]
pub struct RemoteTier {
    backend: Arc<dyn RemoteCacheBackend>,
    namespace: &'static str,
    strict: bool,
}

impl RemoteTier {
    pub fn new(
        backend: Arc<dyn RemoteCacheBackend>,
        namespace: &'static str,
        strict: bool,
    ) -> Self {
        Self {
            backend,
            namespace,
            strict,
        }
    }

    fn scoped_key(&self, key: &str) -> String {
        format!("{}/{key}", self.namespace)
    }

    /// Fetches and decodes; backend failures and corrupt payloads are logged
    /// misses unless strict mode.
    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let bytes = match self.backend.get(&self.scoped_key(key)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(err) if self.strict => return Err(CacheError::Remote(err)),
            Err(err) => {
                log::warn!("remote lookup failed for {}/{key}: {err}", self.namespace);
                return Ok(None);
            }
        };
        match bincode::deserialize(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.strict => Err(CacheError::Codec(err)),
            Err(err) => {
                log::warn!(
                    "treating corrupt remote entry as a miss: {}/{key} ({err})",
                    self.namespace
                );
                Ok(None)
            }
        }
    }

    /// Encodes and stores; failures are soft unless strict mode.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> CacheResult<()> {
        let result = bincode::serialize(value)
            .map_err(CacheError::Codec)
            .and_then(|bytes| {
                self.backend
                    .put(&self.scoped_key(key), &bytes)
                    .map_err(CacheError::Remote)
            });
        match result {
            Ok(()) => Ok(()),
            Err(err) if self.strict => Err(err),
            Err(err) => {
                log::warn!("skipping remote save for {}/{key}: {err}", self.namespace);
                Ok(())
            }
        }
    }
}

/// Plain get/hit/put counters exposed by test doubles.
#[derive(Debug, Default)]
pub struct RemoteCacheStats {
    gets: AtomicU64,
    hits: AtomicU64,
    puts: AtomicU64,
}

impl RemoteCacheStats {
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.gets() - self.hits()
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }
}

/// In-memory backend used by tests and as the reference implementation of
/// the counter contract.
#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    stats: RemoteCacheStats,
}

impl MemoryCacheBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stats(&self) -> &RemoteCacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("memory cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RemoteCacheBackend for MemoryCacheBackend {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.lock().expect("memory cache poisoned");
        let found = entries.get(key).cloned();
        if found.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .expect("memory cache poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
