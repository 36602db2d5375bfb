//! kiln: compilation caching and autotuning for tensor-graph compilers.
//!
//! Given an already-captured [`graph::Graph`] plus example inputs, kiln
//! derives a stable content-addressed key, serves previously-compiled
//! artifacts from in-process, on-disk, and remote tiers, and coordinates
//! out-of-process benchmarking of competing kernel implementations on a
//! crash-tolerant worker pool. The numeric operators, the graph-capture
//! front-end, and the real code generators are external collaborators; kiln
//! consumes them behind the [`artifact::GraphCompiler`] and
//! [`artifact::ProgramExecutor`] traits.

pub mod artifact;
pub mod autotune;
pub mod cache;
pub mod counters;
pub mod env;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod generation;
pub mod graph;
pub mod orchestrator;
pub mod registry;

pub use env::{CacheSettings, TunerSettings};
pub use error::{BypassReason, CacheError, CompileError, TuneError};
pub use fingerprint::{CacheKey, CompileConfig, ConfigValue};
pub use orchestrator::GraphCache;
pub use registry::{KernelDef, KernelId, KernelRegistry};

/// Crate version baked into every fingerprint and cache entry.
pub const KILN_VERSION: &str = env!("CARGO_PKG_VERSION");
