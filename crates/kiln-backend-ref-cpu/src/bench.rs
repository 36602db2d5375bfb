//! Benchmark job handler installed in worker processes.

use std::time::Instant;

use anyhow::{bail, ensure, Result};
use kiln::autotune::{BenchJob, BenchResult, JobHandler};

use crate::kernels::{
    run_matmul, MATMUL_OP, VARIANT_CRASH, VARIANT_FAIL, VARIANT_SHOW_DEVICES,
};

/// Decodes [`BenchJob`] payloads, times the named kernel, and reports the
/// median latency. The `debug-*` variants short-circuit for pool tests.
#[derive(Debug, Default)]
pub struct BenchHandler;

impl BenchHandler {
    pub fn new() -> Self {
        Self
    }
}

impl JobHandler for BenchHandler {
    fn run(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let job: BenchJob = bincode::deserialize(payload)?;
        match job.kernel.variant.as_str() {
            VARIANT_CRASH => {
                // Simulates a kernel taking the whole worker down.
                std::process::abort();
            }
            VARIANT_FAIL => bail!("candidate kernel refused to run"),
            VARIANT_SHOW_DEVICES => {
                let visible =
                    std::env::var(kiln::env::VISIBLE_DEVICES_VAR).unwrap_or_default();
                return Ok(visible.into_bytes());
            }
            _ => {}
        }

        ensure!(
            job.kernel.op == MATMUL_OP,
            "reference worker only times matmul kernels, got `{}`",
            job.kernel.op
        );
        ensure!(
            job.inputs.len() == 2,
            "matmul timing needs two inputs, got {}",
            job.inputs.len()
        );
        let lhs_dims = job.inputs[0]
            .concrete_dims()
            .filter(|dims| dims.len() == 2)
            .ok_or_else(|| anyhow::anyhow!("lhs must be a bound rank-2 tensor"))?;
        let rhs_dims = job.inputs[1]
            .concrete_dims()
            .filter(|dims| dims.len() == 2)
            .ok_or_else(|| anyhow::anyhow!("rhs must be a bound rank-2 tensor"))?;
        let (m, k) = (lhs_dims[0], lhs_dims[1]);
        let (k2, n) = (rhs_dims[0], rhs_dims[1]);
        ensure!(k == k2, "inner extents differ ({k} vs {k2})");

        let a = &job.inputs[0].data;
        let b = &job.inputs[1].data;
        for _ in 0..job.warmup {
            run_matmul(&job.kernel.variant, a, b, m, k, n)?;
        }
        let reps = job.reps.max(1);
        let mut timings = Vec::with_capacity(reps as usize);
        for _ in 0..reps {
            let started = Instant::now();
            let result = run_matmul(&job.kernel.variant, a, b, m, k, n)?;
            timings.push(started.elapsed().as_secs_f64() * 1e3);
            // Keep the product alive so the multiply is not optimized out.
            std::hint::black_box(result);
        }
        timings.sort_by(|x, y| x.partial_cmp(y).expect("timings are finite"));
        let latency_ms = timings[timings.len() / 2];

        Ok(bincode::serialize(&BenchResult { latency_ms })?)
    }
}
