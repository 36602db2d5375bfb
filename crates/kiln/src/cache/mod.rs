//! Cache tiers and the records they store.
//!
//! Three namespaces share one on-disk root:
//! `graph` for compiled-graph entries, `kernel` for generated-kernel
//! definitions, and `autotune` for benchmarking winners. Every namespace
//! follows the same layout: `<root>/<namespace>/<key>/entry`.

pub mod disk;
pub mod memo;
pub mod remote;

use serde::{Deserialize, Serialize};

use crate::artifact::CompiledArtifact;
use crate::registry::KernelDef;

/// Directory name of the compiled-graph namespace.
pub const GRAPH_DIR: &str = "graph";
/// Directory name of the generated-kernel namespace.
pub const KERNEL_DIR: &str = "kernel";
/// Directory name of the autotune-result namespace.
pub const AUTOTUNE_DIR: &str = "autotune";

/// On-disk record for one compiled graph. Created once per unique key,
/// read many times, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub artifact: CompiledArtifact,
    /// One line per field that contributed to the key; diagnostics only.
    pub debug_lines: Vec<String>,
    /// Crate version that wrote the entry; a mismatch on lookup is a miss.
    pub version: String,
}

impl CacheEntry {
    pub fn new(key: String, artifact: CompiledArtifact, debug_lines: Vec<String>) -> Self {
        Self {
            key,
            artifact,
            debug_lines,
            version: crate::KILN_VERSION.to_string(),
        }
    }

    pub fn version_matches(&self) -> bool {
        self.version == crate::KILN_VERSION
    }
}

/// On-disk record for one generated kernel definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelEntry {
    pub key: String,
    pub def: KernelDef,
    pub version: String,
}

impl KernelEntry {
    pub fn new(key: String, def: KernelDef) -> Self {
        Self {
            key,
            def,
            version: crate::KILN_VERSION.to_string(),
        }
    }
}

/// On-disk record for one autotuning winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneEntry {
    pub key: String,
    pub winner: KernelDef,
    pub latency_ms: f64,
    pub version: String,
}

impl TuneEntry {
    pub fn new(key: String, winner: KernelDef, latency_ms: f64) -> Self {
        Self {
            key,
            winner,
            latency_ms,
            version: crate::KILN_VERSION.to_string(),
        }
    }
}
