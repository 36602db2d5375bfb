//! Environment-variable configuration surface.
//!
//! Every knob is read once, parsed into a settings struct, and injectable in
//! tests by constructing the struct directly; nothing outside this module
//! consults the environment at steady state.

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Environment variable naming the cache root directory.
pub const CACHE_DIR_VAR: &str = "KILN_CACHE_DIR";
/// Disables the whole caching mechanism when truthy (forces bypass).
pub const DISABLE_CACHE_VAR: &str = "KILN_DISABLE_CACHE";
/// Turns soft cache failures into hard errors (test suites).
pub const STRICT_CACHE_VAR: &str = "KILN_STRICT_CACHE";
/// Number of benchmark worker subprocesses.
pub const WORKER_COUNT_VAR: &str = "KILN_WORKER_COUNT";
/// Enables one-device-per-job isolation during autotuning.
pub const MULTI_DEVICE_VAR: &str = "KILN_AUTOTUNE_MULTI_DEVICE";
/// The device-visibility variable propagated to workers.
pub const VISIBLE_DEVICES_VAR: &str = "KILN_VISIBLE_DEVICES";
/// Overrides the benchmark worker executable path.
pub const WORKER_EXE_VAR: &str = "KILN_WORKER_EXE";

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn env_bool(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

static CACHE_DISABLED: OnceLock<bool> = OnceLock::new();

/// Whether caching is globally disabled for this process.
pub fn cache_disabled() -> bool {
    *CACHE_DISABLED.get_or_init(|| env_bool(DISABLE_CACHE_VAR).unwrap_or(false))
}

/// Per-namespace tier toggles and global cache behavior.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Root directory holding all namespaces.
    pub cache_dir: PathBuf,
    /// Local disk tier for compiled-graph entries.
    pub local_graph: bool,
    /// Remote tier for compiled-graph entries (requires a backend).
    pub remote_graph: bool,
    /// Local disk tier for autotune results.
    pub local_autotune: bool,
    /// Remote tier for autotune results.
    pub remote_autotune: bool,
    /// Soft cache failures become hard errors.
    pub strict: bool,
    /// Capacity of the in-process rehydrated-program memo.
    pub memo_capacity: usize,
}

impl CacheSettings {
    /// Settings rooted at an explicit directory with everything local-only.
    pub fn at(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            local_graph: true,
            remote_graph: false,
            local_autotune: true,
            remote_autotune: false,
            strict: false,
            memo_capacity: 64,
        }
    }

    /// Resolves settings from the environment once at startup.
    pub fn from_env() -> Self {
        let cache_dir = env::var_os(CACHE_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("kiln-cache"));
        let mut settings = Self::at(cache_dir);
        settings.strict = env_bool(STRICT_CACHE_VAR).unwrap_or(false);
        if let Some(enabled) = env_bool("KILN_LOCAL_GRAPH_CACHE") {
            settings.local_graph = enabled;
        }
        if let Some(enabled) = env_bool("KILN_REMOTE_GRAPH_CACHE") {
            settings.remote_graph = enabled;
        }
        if let Some(enabled) = env_bool("KILN_LOCAL_AUTOTUNE_CACHE") {
            settings.local_autotune = enabled;
        }
        if let Some(enabled) = env_bool("KILN_REMOTE_AUTOTUNE_CACHE") {
            settings.remote_autotune = enabled;
        }
        settings
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Worker pool and benchmarking knobs.
#[derive(Debug, Clone)]
pub struct TunerSettings {
    /// Number of worker subprocesses; `0` benchmarks in-process.
    pub workers: usize,
    /// Path to the worker executable; `None` leaves pool creation to the
    /// caller (in-process benchmarking only).
    pub worker_exe: Option<PathBuf>,
    /// One-device-per-job isolation.
    pub multi_device: bool,
    /// Name of the device-visibility variable seen by workers.
    pub visible_devices_var: String,
    /// Timing repetitions per job.
    pub reps: u32,
    /// Warmup iterations per job.
    pub warmup: u32,
    /// Threads used to precompile candidates before timing.
    pub compile_threads: usize,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            worker_exe: None,
            multi_device: false,
            visible_devices_var: VISIBLE_DEVICES_VAR.to_string(),
            reps: 20,
            warmup: 3,
            compile_threads: 4,
        }
    }
}

impl TunerSettings {
    /// Resolves settings from the environment once at startup.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(value) = env::var(WORKER_COUNT_VAR) {
            if let Ok(count) = value.trim().parse::<usize>() {
                settings.workers = count;
            }
        }
        settings.worker_exe = env::var_os(WORKER_EXE_VAR).map(PathBuf::from);
        settings.multi_device = env_bool(MULTI_DEVICE_VAR).unwrap_or(false);
        settings
    }
}
