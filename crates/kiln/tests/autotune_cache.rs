//! Autotune-result cache behavior across tuner instances.

use std::sync::Arc;

use kiln::autotune::{BenchJob, BenchResult, JobHandler, Tuner};
use kiln::counters;
use kiln::graph::inputs::TensorValue;
use kiln::graph::spec::{DType, Device, Shape, TensorDesc};
use kiln::orchestrator::autotune_cache_tiers;
use kiln::{CacheSettings, KernelDef, TunerSettings};

/// Replies with a fixed latency per variant and counts invocations.
struct CountingHandler {
    latencies: Vec<(&'static str, f64)>,
    calls: std::sync::atomic::AtomicUsize,
}

impl JobHandler for CountingHandler {
    fn run(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let job: BenchJob = bincode::deserialize(payload)?;
        let (_, latency_ms) = self
            .latencies
            .iter()
            .find(|(variant, _)| *variant == job.kernel.variant)
            .expect("scripted variant");
        Ok(bincode::serialize(&BenchResult {
            latency_ms: *latency_ms,
        })?)
    }
}

fn jobs() -> Vec<BenchJob> {
    let desc = TensorDesc::contiguous(Device::Cpu, DType::F32, Shape::of(&[8, 8]));
    let tensor = TensorValue::new(desc, vec![1.0; 64]);
    ["naive", "blocked"]
        .iter()
        .map(|variant| BenchJob {
            kernel: KernelDef::new("matmul", *variant),
            inputs: vec![tensor.clone(), tensor.clone()],
            warmup: 0,
            reps: 1,
        })
        .collect()
}

#[test]
fn warm_result_cache_skips_benchmarking_across_tuners() -> anyhow::Result<()> {
    counters::reset();
    let dir = tempfile::tempdir()?;
    let settings = CacheSettings::at(dir.path());

    let handler = Arc::new(CountingHandler {
        latencies: vec![("naive", 3.0), ("blocked", 1.0)],
        calls: std::sync::atomic::AtomicUsize::new(0),
    });

    let (local, remote) = autotune_cache_tiers(&settings, None);
    let first = Tuner::in_process(handler.clone(), TunerSettings::default())
        .with_result_cache(local, remote);
    let selection = first.select(jobs())?;
    assert_eq!(selection.kernel.variant, "blocked");
    assert_eq!(
        handler.calls.load(std::sync::atomic::Ordering::SeqCst),
        2,
        "both candidates timed on the cold round"
    );
    assert_eq!(counters::get(counters::AUTOTUNE_CACHE_MISS), 1);

    // A fresh tuner over the same cache root must not benchmark at all.
    let (local, remote) = autotune_cache_tiers(&settings, None);
    let second = Tuner::in_process(handler.clone(), TunerSettings::default())
        .with_result_cache(local, remote);
    let cached = second.select(jobs())?;
    assert_eq!(cached.kernel.variant, "blocked");
    assert_eq!(
        handler.calls.load(std::sync::atomic::Ordering::SeqCst),
        2,
        "warm round must not invoke the handler"
    );
    assert_eq!(counters::get(counters::AUTOTUNE_CACHE_HIT), 1);
    Ok(())
}
