//! Out-of-process autotuning.
//!
//! When a lowering decision has more than one viable kernel, the compiler
//! builds one [`BenchJob`] per candidate and asks the [`Tuner`] for the
//! fastest. Timing runs in worker subprocesses (see [`pool`]) so a crashed
//! candidate cannot corrupt the parent process or its device context.

pub mod pool;
pub mod protocol;
pub mod tuner;
pub mod worker;

use serde::{Deserialize, Serialize};

use crate::graph::inputs::TensorValue;
use crate::registry::KernelDef;

pub use pool::{on_fork_child, shutdown_worker_pools, JobHandle, PoolOptions, SubprocPool};
pub use tuner::{precompile_candidates, Selection, Tuner};

/// One candidate-kernel timing job: execute the kernel against the given
/// arguments `reps` times after `warmup` untimed runs, report the median.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchJob {
    pub kernel: KernelDef,
    pub inputs: Vec<TensorValue>,
    pub warmup: u32,
    pub reps: u32,
}

/// The scalar a timing job reports back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BenchResult {
    pub latency_ms: f64,
}

/// Executes opaque job payloads inside a worker. The worker binary installs
/// a handler that understands [`BenchJob`]; the pool itself never inspects
/// payloads.
pub trait JobHandler: Send + Sync {
    fn run(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>>;
}
