//! Benchmark worker subprocess pool.
//!
//! One driver thread per worker lives in the parent: it pulls queued jobs,
//! feeds its subprocess over stdin, and drains results from stdout. A dead
//! worker resolves its in-flight job as a crash (the tuner treats that as
//! infinite latency) and is respawned before the next job, so a crash never
//! wedges the pool. Pools register themselves process-wide so shutdown hooks
//! and fork handlers can reach every live pool.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use once_cell::sync::Lazy;

use super::protocol::{read_frame, write_frame, JobOutcome, SHUTDOWN_JOB_ID};
use crate::counters;
use crate::env::VISIBLE_DEVICES_VAR;
use crate::error::{TuneError, TuneResult};

/// How a pool is spawned and what its workers observe.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: usize,
    pub worker_exe: PathBuf,
    /// Pin each worker to one device drawn from the parent's visible set.
    pub multi_device: bool,
    /// Name of the device-visibility variable.
    pub visible_devices_var: String,
    /// Extra environment forwarded verbatim to every worker.
    pub extra_env: Vec<(String, String)>,
}

impl PoolOptions {
    pub fn new(worker_exe: impl Into<PathBuf>) -> Self {
        Self {
            workers: 2,
            worker_exe: worker_exe.into(),
            multi_device: false,
            visible_devices_var: VISIBLE_DEVICES_VAR.to_string(),
            extra_env: Vec::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_multi_device(mut self, multi_device: bool) -> Self {
        self.multi_device = multi_device;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }
}

struct JobSlot {
    result: Mutex<Option<TuneResult<Vec<u8>>>>,
    done: Condvar,
}

impl JobSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    fn resolve(&self, result: TuneResult<Vec<u8>>) {
        let mut slot = self.result.lock().expect("job slot poisoned");
        if slot.is_none() {
            *slot = Some(result);
        }
        self.done.notify_all();
    }
}

/// Handle to one submitted job; resolves exactly once.
pub struct JobHandle {
    slot: Arc<JobSlot>,
}

impl JobHandle {
    /// Blocks until the job resolves.
    pub fn wait(self) -> TuneResult<Vec<u8>> {
        let mut guard = self.slot.result.lock().expect("job slot poisoned");
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            guard = self.slot.done.wait(guard).expect("job slot poisoned");
        }
    }

    /// Non-blocking readiness check.
    pub fn is_done(&self) -> bool {
        self.slot
            .result
            .lock()
            .expect("job slot poisoned")
            .is_some()
    }
}

struct QueuedJob {
    job_id: i64,
    payload: Vec<u8>,
    slot: Arc<JobSlot>,
}

struct QueueState {
    jobs: VecDeque<QueuedJob>,
    closed: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
    options: PoolOptions,
}

impl Shared {
    /// Marks the pool closed and fails every job that never started.
    fn close(&self) {
        let drained = {
            let mut state = self.queue.lock().expect("pool queue poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.jobs)
        };
        for job in drained {
            job.slot.resolve(Err(TuneError::PoolClosed));
        }
        self.available.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.queue.lock().expect("pool queue poisoned").closed
    }
}

static POOL_REGISTRY: Lazy<Mutex<Vec<Weak<Shared>>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn register_pool(shared: &Arc<Shared>) {
    let mut registry = POOL_REGISTRY.lock().expect("pool registry poisoned");
    registry.retain(|weak| weak.strong_count() > 0);
    registry.push(Arc::downgrade(shared));
}

/// Closes every live pool. Intended for process-exit hooks and tests.
pub fn shutdown_worker_pools() {
    let pools: Vec<Arc<Shared>> = {
        let registry = POOL_REGISTRY.lock().expect("pool registry poisoned");
        registry.iter().filter_map(Weak::upgrade).collect()
    };
    for pool in pools {
        pool.close();
    }
}

/// Fork hook for the child process: pools are owned by the parent, so the
/// child must not inherit them. Marks everything closed and forgets it
/// without touching the parent's file descriptors or subprocesses.
pub fn on_fork_child() {
    let mut registry = POOL_REGISTRY.lock().expect("pool registry poisoned");
    for pool in registry.iter().filter_map(Weak::upgrade) {
        pool.close();
    }
    registry.clear();
}

struct WorkerProc {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
}

impl WorkerProc {
    fn spawn(options: &PoolOptions, index: usize) -> std::io::Result<Self> {
        let mut command = Command::new(&options.worker_exe);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        for (key, value) in &options.extra_env {
            command.env(key, value);
        }
        if options.multi_device {
            // One device per worker, drawn round-robin from the parent's
            // visible set, so concurrent jobs never contend for a device.
            // With multi-device off the child inherits the parent's setting
            // untouched.
            let visible = std::env::var(&options.visible_devices_var)
                .unwrap_or_else(|_| "0".to_string());
            let devices: Vec<&str> = visible
                .split(',')
                .map(str::trim)
                .filter(|device| !device.is_empty())
                .collect();
            let pinned = if devices.is_empty() {
                "0"
            } else {
                devices[index % devices.len()]
            };
            command.env(&options.visible_devices_var, pinned);
        }
        let mut child = command.spawn()?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout,
        })
    }

    /// Sends one job and blocks for its reply. Any io failure here means the
    /// worker is gone.
    fn run(&mut self, job_id: i64, payload: &[u8]) -> std::io::Result<JobOutcome> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::other("worker stdin already closed"))?;
        write_frame(stdin, job_id, payload)?;
        match read_frame(&mut self.stdout)? {
            Some((reply_id, bytes)) if reply_id == job_id => bincode::deserialize(&bytes)
                .map_err(|err| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("undecodable worker reply: {err}"),
                    )
                }),
            Some((reply_id, _)) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("worker answered job {reply_id}, expected {job_id}"),
            )),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "worker closed its pipe mid-job",
            )),
        }
    }

    fn shutdown(mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = write_frame(&mut stdin, SHUTDOWN_JOB_ID, &[]);
        }
        // Dropping stdin closes the pipe; the worker exits on EOF even if it
        // missed the sentinel.
        let _ = self.child.wait();
    }

    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn driver_loop(shared: Arc<Shared>, index: usize) {
    let mut worker: Option<WorkerProc> = None;
    let mut spawned_once = false;

    loop {
        let job = {
            let mut state = shared.queue.lock().expect("pool queue poisoned");
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break Some(job);
                }
                if state.closed {
                    break None;
                }
                state = shared.available.wait(state).expect("pool queue poisoned");
            }
        };
        let Some(job) = job else { break };

        if worker.is_none() {
            match WorkerProc::spawn(&shared.options, index) {
                Ok(spawned) => {
                    if spawned_once {
                        counters::bump(counters::WORKER_RESPAWN);
                    }
                    spawned_once = true;
                    worker = Some(spawned);
                }
                Err(err) => {
                    job.slot.resolve(Err(TuneError::WorkerCrash {
                        details: format!("failed to spawn benchmark worker: {err}"),
                    }));
                    continue;
                }
            }
        }

        let proc = worker.as_mut().expect("worker was just ensured");
        match proc.run(job.job_id, &job.payload) {
            Ok(JobOutcome::Ok(bytes)) => job.slot.resolve(Ok(bytes)),
            Ok(JobOutcome::Err(details)) => {
                job.slot.resolve(Err(TuneError::Subproc { details }));
            }
            Err(err) => {
                counters::bump(counters::WORKER_CRASH);
                log::warn!("benchmark worker {index} died mid-job: {err}");
                job.slot.resolve(Err(TuneError::WorkerCrash {
                    details: err.to_string(),
                }));
                if let Some(dead) = worker.take() {
                    dead.kill();
                }
            }
        }
    }

    if let Some(live) = worker.take() {
        live.shutdown();
    }
}

/// A persistent pool of benchmark worker subprocesses.
pub struct SubprocPool {
    shared: Arc<Shared>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
    next_job_id: AtomicI64,
    ready: Mutex<Option<JobHandle>>,
}

impl SubprocPool {
    /// Spawns driver threads (workers start lazily with their first job) and
    /// submits a readiness probe.
    pub fn new(options: PoolOptions) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            options,
        });
        register_pool(&shared);

        let drivers = (0..shared.options.workers.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("kiln-bench-driver-{index}"))
                    .spawn(move || driver_loop(shared, index))
                    .expect("driver thread spawn failed")
            })
            .collect();

        let pool = Self {
            shared,
            drivers: Mutex::new(drivers),
            next_job_id: AtomicI64::new(0),
            ready: Mutex::new(None),
        };
        let probe = pool.submit(Vec::new()).ok();
        *pool.ready.lock().expect("ready slot poisoned") = probe;
        pool
    }

    /// Enqueues one opaque job payload.
    pub fn submit(&self, payload: Vec<u8>) -> TuneResult<JobHandle> {
        let slot = JobSlot::new();
        let job = QueuedJob {
            job_id: self.next_job_id.fetch_add(1, Ordering::Relaxed),
            payload,
            slot: Arc::clone(&slot),
        };
        {
            let mut state = self.shared.queue.lock().expect("pool queue poisoned");
            if state.closed {
                return Err(TuneError::PoolClosed);
            }
            state.jobs.push_back(job);
        }
        self.shared.available.notify_one();
        Ok(JobHandle { slot })
    }

    /// Whether the readiness probe has resolved.
    pub fn is_ready(&self) -> bool {
        let ready = self.ready.lock().expect("ready slot poisoned");
        ready.as_ref().map(JobHandle::is_done).unwrap_or(true)
    }

    /// Blocks until the first worker has served the readiness probe.
    pub fn wait_until_ready(&self) -> TuneResult<()> {
        let probe = self.ready.lock().expect("ready slot poisoned").take();
        if let Some(handle) = probe {
            handle.wait()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Idempotent shutdown: fails queued jobs with [`TuneError::PoolClosed`],
    /// lets in-flight jobs finish, and reaps every worker.
    pub fn terminate(&self) {
        self.shared.close();
        let drivers = {
            let mut slot = self.drivers.lock().expect("driver table poisoned");
            std::mem::take(&mut *slot)
        };
        for driver in drivers {
            let _ = driver.join();
        }
    }
}

impl Drop for SubprocPool {
    fn drop(&mut self) {
        self.terminate();
    }
}
