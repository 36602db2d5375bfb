//! Local disk tier.
//!
//! Layout: `<root>/<namespace>/<key>/entry`, one serialized record per key
//! directory, created lazily on first save. Writes go through a temporary
//! file in the destination directory followed by a rename, so a concurrent
//! reader never observes a partial entry; that rename is the only
//! cross-process coordination. Concurrent writers to the same key race
//! harmlessly because content for a key is deterministic.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

const ENTRY_FILE: &str = "entry";

/// One namespace of the on-disk store.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    namespace: &'static str,
    strict: bool,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>, namespace: &'static str, strict: bool) -> Self {
        Self {
            root: root.into(),
            namespace,
            strict,
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    fn namespace_dir(&self) -> PathBuf {
        self.root.join(self.namespace)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.namespace_dir().join(key).join(ENTRY_FILE)
    }

    /// Reads the raw entry bytes for `key`. A missing directory or file is
    /// `None`; an unreadable file is a logged miss unless strict mode.
    pub fn lookup_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) if self.strict => Err(CacheError::Io(err)),
            Err(err) => {
                log::warn!(
                    "treating unreadable cache entry as a miss: {} ({err})",
                    path.display()
                );
                Ok(None)
            }
        }
    }

    /// Reads and decodes the entry for `key`. A corrupt entry is a logged
    /// miss unless strict mode.
    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let Some(bytes) = self.lookup_bytes(key)? else {
            return Ok(None);
        };
        match bincode::deserialize(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.strict => Err(CacheError::Codec(err)),
            Err(err) => {
                log::warn!(
                    "treating corrupt cache entry as a miss: {}/{key} ({err})",
                    self.namespace
                );
                Ok(None)
            }
        }
    }

    /// Atomically writes raw entry bytes for `key`.
    pub fn save_bytes(&self, key: &str, bytes: &[u8]) -> CacheResult<()> {
        let dir = self.namespace_dir().join(key);
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(dir.join(ENTRY_FILE))
            .map_err(|err| CacheError::Io(err.error))?;
        Ok(())
    }

    /// Serializes and writes the entry for `key`. Failures are soft (logged,
    /// entry skipped) unless strict mode, in which case they propagate.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> CacheResult<()> {
        let result = bincode::serialize(value)
            .map_err(CacheError::Codec)
            .and_then(|bytes| self.save_bytes(key, &bytes));
        match result {
            Ok(()) => Ok(()),
            Err(err) if self.strict => Err(err),
            Err(err) => {
                log::warn!("skipping cache save for {}/{key}: {err}", self.namespace);
                Ok(())
            }
        }
    }

    /// Removes this namespace entirely; tolerates "already absent."
    pub fn clear(&self) -> CacheResult<()> {
        match std::fs::remove_dir_all(self.namespace_dir()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::Io(err)),
        }
    }

    /// Whether an entry file exists for `key` (no decode attempted).
    pub fn contains(&self, key: &str) -> bool {
        self.entry_path(key).is_file()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
