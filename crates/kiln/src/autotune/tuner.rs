//! Candidate selection.
//!
//! The tuner owns where timing happens (worker pool or in-process fallback)
//! and the autotune-result cache that lets a warm process skip benchmarking
//! entirely. Crashed or failed candidates come back as infinite latency and
//! are never selected; a round where everything is infinite is a hard
//! [`TuneError::NoValidChoices`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::pool::SubprocPool;
use super::{BenchJob, BenchResult, JobHandler};
use crate::cache::disk::DiskCache;
use crate::cache::remote::RemoteTier;
use crate::cache::TuneEntry;
use crate::counters;
use crate::env::TunerSettings;
use crate::error::{TuneError, TuneResult};
use crate::fingerprint::autotune_key;
use crate::graph::spec::{DType, Device};
use crate::registry::KernelDef;

/// The winning candidate of one autotuning round.
#[derive(Debug, Clone)]
pub struct Selection {
    pub index: usize,
    pub kernel: KernelDef,
    pub latency_ms: f64,
}

enum BenchExecutor {
    /// Jobs run on the calling thread. A hard crash takes the process down;
    /// only suitable when no pool is configured.
    InProcess(Arc<dyn JobHandler>),
    Pool(SubprocPool),
}

/// Autotuning façade handed to compilers through the compile context.
pub struct Tuner {
    bench: BenchExecutor,
    settings: TunerSettings,
    local_cache: Option<DiskCache>,
    remote_cache: Option<RemoteTier>,
}

impl Tuner {
    pub fn in_process(handler: Arc<dyn JobHandler>, settings: TunerSettings) -> Self {
        Self {
            bench: BenchExecutor::InProcess(handler),
            settings,
            local_cache: None,
            remote_cache: None,
        }
    }

    pub fn with_pool(pool: SubprocPool, settings: TunerSettings) -> Self {
        Self {
            bench: BenchExecutor::Pool(pool),
            settings,
            local_cache: None,
            remote_cache: None,
        }
    }

    /// Attaches the autotune-result cache tiers.
    pub fn with_result_cache(
        mut self,
        local: Option<DiskCache>,
        remote: Option<RemoteTier>,
    ) -> Self {
        self.local_cache = local;
        self.remote_cache = remote;
        self
    }

    pub fn settings(&self) -> &TunerSettings {
        &self.settings
    }

    /// Times every job; order of results matches order of jobs. Crashes and
    /// in-job failures become `f64::INFINITY`; pool-closed and submission
    /// failures propagate.
    pub fn benchmark(&self, jobs: &[BenchJob]) -> TuneResult<Vec<f64>> {
        match &self.bench {
            BenchExecutor::Pool(pool) => {
                let mut handles = Vec::with_capacity(jobs.len());
                for job in jobs {
                    let payload = bincode::serialize(job)?;
                    handles.push(pool.submit(payload)?);
                }
                let mut latencies = Vec::with_capacity(handles.len());
                for (idx, handle) in handles.into_iter().enumerate() {
                    let latency = match handle.wait() {
                        Ok(bytes) => decode_latency(&jobs[idx].kernel, &bytes),
                        Err(TuneError::WorkerCrash { details }) => {
                            log::warn!(
                                "candidate {} crashed its worker: {details}",
                                jobs[idx].kernel.variant
                            );
                            f64::INFINITY
                        }
                        Err(TuneError::Subproc { details }) => {
                            log::warn!(
                                "candidate {} failed in the worker: {details}",
                                jobs[idx].kernel.variant
                            );
                            f64::INFINITY
                        }
                        Err(err) => return Err(err),
                    };
                    latencies.push(latency);
                }
                Ok(latencies)
            }
            BenchExecutor::InProcess(handler) => jobs
                .iter()
                .map(|job| {
                    let payload = bincode::serialize(job)?;
                    Ok(match handler.run(&payload) {
                        Ok(bytes) => decode_latency(&job.kernel, &bytes),
                        Err(err) => {
                            log::warn!(
                                "candidate {} failed in-process: {err:#}",
                                job.kernel.variant
                            );
                            f64::INFINITY
                        }
                    })
                })
                .collect(),
        }
    }

    /// Picks the fastest candidate, consulting the result cache first.
    pub fn select(&self, jobs: Vec<BenchJob>) -> TuneResult<Selection> {
        if jobs.is_empty() {
            return Err(TuneError::NoValidChoices { tried: 0 });
        }
        if jobs.len() == 1 {
            // Nothing to tune; the only candidate wins unmeasured.
            return Ok(Selection {
                index: 0,
                kernel: jobs.into_iter().next().expect("len checked").kernel,
                latency_ms: 0.0,
            });
        }

        let key = autotune_key(&TuneKeyDetail::of(&jobs)).ok();
        if let Some(key) = &key {
            if let Some(cached) = self.cached_selection(key.as_str(), &jobs) {
                counters::bump(counters::AUTOTUNE_CACHE_HIT);
                return Ok(cached);
            }
            if self.local_cache.is_some() || self.remote_cache.is_some() {
                counters::bump(counters::AUTOTUNE_CACHE_MISS);
            }
        }

        let tried = jobs.len();
        let latencies = self.benchmark(&jobs)?;
        let winner = latencies
            .iter()
            .enumerate()
            .filter(|(_, latency)| latency.is_finite())
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).expect("finite latencies compare"))
            .map(|(index, latency)| (index, *latency));
        let Some((index, latency_ms)) = winner else {
            return Err(TuneError::NoValidChoices { tried });
        };

        let kernel = jobs[index].kernel.clone();
        if let Some(key) = &key {
            let entry = TuneEntry::new(key.to_string(), kernel.clone(), latency_ms);
            if let Some(local) = &self.local_cache {
                let _ = local.save(key.as_str(), &entry);
            }
            if let Some(remote) = &self.remote_cache {
                let _ = remote.save(key.as_str(), &entry);
            }
        }

        Ok(Selection {
            index,
            kernel,
            latency_ms,
        })
    }

    fn cached_selection(&self, key: &str, jobs: &[BenchJob]) -> Option<Selection> {
        let entry: TuneEntry = self
            .lookup_tune_entry(key)
            .filter(|entry| entry.version == crate::KILN_VERSION)?;
        let index = jobs
            .iter()
            .position(|job| job.kernel == entry.winner)?;
        Some(Selection {
            index,
            kernel: entry.winner,
            latency_ms: entry.latency_ms,
        })
    }

    fn lookup_tune_entry(&self, key: &str) -> Option<TuneEntry> {
        if let Some(local) = &self.local_cache {
            if let Ok(Some(entry)) = local.lookup::<TuneEntry>(key) {
                return Some(entry);
            }
        }
        if let Some(remote) = &self.remote_cache {
            if let Ok(Some(entry)) = remote.lookup::<TuneEntry>(key) {
                // Write the remote hit back into the local tier.
                if let Some(local) = &self.local_cache {
                    let _ = local.save(key, &entry);
                }
                return Some(entry);
            }
        }
        None
    }

    /// Terminates the pool if this tuner owns one.
    pub fn shutdown(&self) {
        if let BenchExecutor::Pool(pool) = &self.bench {
            pool.terminate();
        }
    }
}

fn decode_latency(kernel: &KernelDef, bytes: &[u8]) -> f64 {
    match bincode::deserialize::<BenchResult>(bytes) {
        Ok(result) => result.latency_ms,
        Err(err) => {
            log::warn!(
                "candidate {} returned an undecodable result: {err}",
                kernel.variant
            );
            f64::INFINITY
        }
    }
}

/// What identifies one autotuning problem: the candidate set, the concrete
/// argument extents, and placement. Sizes are hashed by value here because
/// autotuning is size-specific even when compilation is dynamic.
#[derive(Serialize)]
struct TuneKeyDetail {
    candidates: Vec<KernelDef>,
    inputs: Vec<(Device, DType, Vec<usize>)>,
}

impl TuneKeyDetail {
    fn of(jobs: &[BenchJob]) -> Self {
        let candidates = jobs.iter().map(|job| job.kernel.clone()).collect();
        let inputs = jobs
            .first()
            .map(|job| {
                job.inputs
                    .iter()
                    .map(|tensor| {
                        (
                            tensor.desc.device,
                            tensor.desc.dtype,
                            tensor.concrete_dims().unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { candidates, inputs }
    }
}

/// Runs `prepare` for every candidate across up to `threads` scoped threads.
/// Used to precompile kernels before timing so the benchmark measures
/// execution, not compilation.
pub fn precompile_candidates<F>(kernels: &[KernelDef], threads: usize, prepare: F)
where
    F: Fn(&KernelDef) + Sync,
{
    if kernels.is_empty() {
        return;
    }
    let workers = threads.max(1).min(kernels.len());
    let next = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::Relaxed);
                if idx >= kernels.len() {
                    break;
                }
                prepare(&kernels[idx]);
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::graph::inputs::TensorValue;
    use crate::graph::spec::{Shape, TensorDesc};

    /// Scripted handler: latency per variant, or a failure.
    struct ScriptedHandler {
        script: Vec<(&'static str, Result<f64, &'static str>)>,
    }

    impl JobHandler for ScriptedHandler {
        fn run(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
            let job: BenchJob = bincode::deserialize(payload)?;
            let (_, outcome) = self
                .script
                .iter()
                .find(|(variant, _)| *variant == job.kernel.variant)
                .expect("scripted variant");
            match outcome {
                Ok(latency_ms) => Ok(bincode::serialize(&BenchResult {
                    latency_ms: *latency_ms,
                })?),
                Err(message) => anyhow::bail!("{message}"),
            }
        }
    }

    fn job(variant: &str) -> BenchJob {
        let desc = TensorDesc::contiguous(Device::Cpu, DType::F32, Shape::of(&[4, 4]));
        BenchJob {
            kernel: KernelDef::new("matmul", variant),
            inputs: vec![TensorValue::new(desc, vec![1.0; 16])],
            warmup: 0,
            reps: 1,
        }
    }

    fn tuner(script: Vec<(&'static str, Result<f64, &'static str>)>) -> Tuner {
        Tuner::in_process(
            Arc::new(ScriptedHandler { script }),
            TunerSettings::default(),
        )
    }

    #[test]
    fn select_picks_minimum_finite_latency() {
        let tuner = tuner(vec![
            ("naive", Ok(5.0)),
            ("blocked", Ok(1.5)),
            ("transposed", Ok(3.0)),
        ]);
        let selection = tuner
            .select(vec![job("naive"), job("blocked"), job("transposed")])
            .unwrap();
        assert_eq!(selection.kernel.variant, "blocked");
        assert_eq!(selection.index, 1);
        assert_eq!(selection.latency_ms, 1.5);
    }

    #[test]
    fn failed_candidates_are_never_selected() {
        let tuner = tuner(vec![("naive", Err("boom")), ("blocked", Ok(9.0))]);
        let selection = tuner.select(vec![job("naive"), job("blocked")]).unwrap();
        assert_eq!(selection.kernel.variant, "blocked");
    }

    #[test]
    fn all_failures_surface_no_valid_choices() {
        let tuner = tuner(vec![("naive", Err("boom")), ("blocked", Err("bang"))]);
        match tuner.select(vec![job("naive"), job("blocked")]) {
            Err(TuneError::NoValidChoices { tried }) => assert_eq!(tried, 2),
            other => panic!("expected NoValidChoices, got {other:?}"),
        }
    }

    #[test]
    fn single_candidate_skips_benchmarking() {
        // The scripted handler would fail this variant; it must not run.
        let tuner = tuner(vec![("naive", Err("should not be timed"))]);
        let selection = tuner.select(vec![job("naive")]).unwrap();
        assert_eq!(selection.kernel.variant, "naive");
    }

    #[test]
    fn result_cache_skips_benchmarking_on_second_round() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), crate::cache::AUTOTUNE_DIR, false);

        let first = tuner(vec![("naive", Ok(4.0)), ("blocked", Ok(2.0))])
            .with_result_cache(Some(cache.clone()), None);
        let selection = first.select(vec![job("naive"), job("blocked")]).unwrap();
        assert_eq!(selection.kernel.variant, "blocked");

        // Second tuner would report inverted latencies; the cached winner
        // must be returned without timing anything.
        let second = tuner(vec![("naive", Ok(0.1)), ("blocked", Err("cold"))])
            .with_result_cache(Some(cache), None);
        let cached = second.select(vec![job("naive"), job("blocked")]).unwrap();
        assert_eq!(cached.kernel.variant, "blocked");
        assert_eq!(cached.latency_ms, 2.0);
    }

    #[test]
    fn precompile_visits_every_candidate_once() {
        let kernels: Vec<KernelDef> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|variant| KernelDef::new("matmul", *variant))
            .collect();
        let seen = Mutex::new(Vec::new());
        precompile_candidates(&kernels, 3, |kernel| {
            seen.lock().unwrap().push(kernel.variant.clone());
        });
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }
}
