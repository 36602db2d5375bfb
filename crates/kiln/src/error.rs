//! Error taxonomy for the caching and autotuning layers.
//!
//! Cache-internal failures are designed to be absorbed by the orchestrator
//! (logged, counted, and traded for a recompile) unless strict mode is on;
//! failures about the computation itself always propagate.

use std::fmt;

use thiserror::Error;

/// Why a particular graph cannot be fingerprinted safely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassReason {
    /// A node invokes an operator outside the allow-list.
    UnsafeOp { op: String },
    /// The call happened inside an enclosing compilation region.
    NestedCompile,
    /// Caching is globally disabled for this process.
    CacheDisabled,
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BypassReason::UnsafeOp { op } => write!(f, "unsafe operator `{op}`"),
            BypassReason::NestedCompile => f.write_str("nested compilation region"),
            BypassReason::CacheDisabled => f.write_str("caching disabled"),
        }
    }
}

/// Errors raised by the key builder and cache tiers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The input is structurally ineligible for caching. Always recoverable:
    /// the orchestrator falls through to direct compilation.
    #[error("cache bypass: {0}")]
    Bypass(BypassReason),

    /// An entry could not be encoded or decoded.
    #[error("cache entry serialization failed: {0}")]
    Codec(#[from] bincode::Error),

    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),

    /// Remote tier failure, wrapped so callers can keep it soft.
    #[error("remote cache: {0}")]
    Remote(anyhow::Error),
}

impl CacheError {
    pub fn is_bypass(&self) -> bool {
        matches!(self, CacheError::Bypass(_))
    }
}

/// Errors raised by the benchmark worker pool and candidate selection.
#[derive(Debug, Error)]
pub enum TuneError {
    /// Submission after `terminate()`.
    #[error("benchmark worker pool is closed")]
    PoolClosed,

    /// The job's worker died before replying. Recoverable at the pool level:
    /// the result becomes infinite latency and the worker is respawned.
    #[error("benchmark worker crashed: {details}")]
    WorkerCrash { details: String },

    /// The job itself failed inside the worker; `details` carries the
    /// formatted trace text sent back over the pipe.
    #[error("an error occurred in a benchmark worker:\n\n{details}")]
    Subproc { details: String },

    /// Every candidate in an autotuning round failed or crashed. Hard error:
    /// there is no usable kernel to return.
    #[error("no valid kernel choices: all {tried} candidate(s) failed")]
    NoValidChoices { tried: usize },

    #[error("benchmark message codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("benchmark io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by `compile_fn` implementations and the orchestrator.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("lowering failed: {0}")]
    Lowering(String),

    #[error(transparent)]
    Tune(#[from] TuneError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;
pub type TuneResult<T> = Result<T, TuneError>;
pub type CompileResult<T> = Result<T, CompileError>;
