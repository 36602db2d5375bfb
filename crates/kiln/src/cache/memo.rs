//! In-process memo of rehydrated programs.
//!
//! Sits in front of the disk and remote tiers so a process that already
//! rehydrated a key never touches storage again, and enforces the "at most
//! one fresh compilation per key and process" guarantee under non-concurrent
//! calls. Resettable independently of the durable tiers.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::artifact::ExecutableProgram;

/// One memoized program plus the mutation generation it was sealed at.
#[derive(Clone)]
pub struct MemoEntry {
    pub program: Arc<ExecutableProgram>,
    pub generation: u64,
}

/// LRU memo keyed by cache-key string.
pub struct ProgramMemo {
    entries: Mutex<LruCache<String, MemoEntry>>,
}

impl ProgramMemo {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<MemoEntry> {
        let mut entries = self.entries.lock().expect("program memo poisoned");
        entries.get(key).cloned()
    }

    pub fn insert(&self, key: String, entry: MemoEntry) {
        let mut entries = self.entries.lock().expect("program memo poisoned");
        entries.put(key, entry);
    }

    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().expect("program memo poisoned");
        entries.pop(key);
    }

    /// Drops every memoized program. The durable tiers are untouched.
    pub fn clear(&self) {
        self.entries.lock().expect("program memo poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("program memo poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
