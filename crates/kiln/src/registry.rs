//! Kernel side-table.
//!
//! Serialized artifacts cannot embed runnable kernel objects, so executable
//! programs reference kernels through small integer ids handed out here. The
//! registry is an explicit, cloneable handle owned by the compile context
//! rather than a module-level singleton, so tests can reset state by
//! dropping it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Serializable description of one generated kernel: enough to rebuild a
/// runnable implementation on the executor side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelDef {
    /// Operator the kernel implements (e.g. `matmul`).
    pub op: String,
    /// Implementation variant chosen for it (e.g. `blocked`).
    pub variant: String,
}

impl KernelDef {
    pub fn new(op: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            variant: variant.into(),
        }
    }
}

/// Process-local id of a registered kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u32);

#[derive(Default)]
struct RegistryInner {
    kernels: Vec<KernelDef>,
    by_def: HashMap<KernelDef, KernelId>,
}

/// Cloneable handle to a kernel side-table.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kernel and returns its id; re-registering an identical
    /// definition returns the existing id.
    pub fn add(&self, def: KernelDef) -> KernelId {
        let mut inner = self.inner.lock().expect("kernel registry poisoned");
        if let Some(id) = inner.by_def.get(&def) {
            return *id;
        }
        let id = KernelId(inner.kernels.len() as u32);
        inner.kernels.push(def.clone());
        inner.by_def.insert(def, id);
        id
    }

    pub fn get(&self, id: KernelId) -> Option<KernelDef> {
        let inner = self.inner.lock().expect("kernel registry poisoned");
        inner.kernels.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("kernel registry poisoned")
            .kernels
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
