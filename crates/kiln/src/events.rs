//! Structured cache events.
//!
//! Every orchestrator operation emits exactly one [`CacheEvent`] to the
//! installed sink. The default sink logs at debug level; test suites install
//! a recording sink through [`install_global_sink`] and inspect what flowed.

use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::Serialize;

/// Final disposition of one cache operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    Bypass,
}

/// One structured observability record.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent {
    /// Cache namespace the operation belongs to (e.g. `graph`).
    pub namespace: &'static str,
    /// The derived key; empty for bypasses, which never computed one.
    pub key: String,
    pub outcome: CacheOutcome,
    /// One line per field that contributed to the key, or the bypass reason.
    pub debug_lines: Vec<String>,
    /// Wall time spent in the operation, in microseconds.
    pub elapsed_us: u64,
}

impl CacheEvent {
    /// JSON rendering for sinks that forward to external telemetry.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Receives cache events. Implementations must be cheap and non-blocking;
/// the orchestrator calls them inline.
pub trait CacheEventSink: Send + Sync {
    fn record(&self, event: &CacheEvent);
}

struct LogSink;

impl CacheEventSink for LogSink {
    fn record(&self, event: &CacheEvent) {
        log::debug!(
            "cache event: namespace={} outcome={:?} key={}",
            event.namespace,
            event.outcome,
            event.key
        );
    }
}

static GLOBAL_SINK: Lazy<RwLock<Arc<dyn CacheEventSink>>> =
    Lazy::new(|| RwLock::new(Arc::new(LogSink)));

/// Restores the previously-installed sink on drop.
pub struct SinkGuard {
    previous: Option<Arc<dyn CacheEventSink>>,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *GLOBAL_SINK.write().expect("event sink lock poisoned") = previous;
        }
    }
}

/// Installs `sink` as the process-wide event sink until the guard drops.
pub fn install_global_sink(sink: Arc<dyn CacheEventSink>) -> SinkGuard {
    let mut slot = GLOBAL_SINK.write().expect("event sink lock poisoned");
    let previous = std::mem::replace(&mut *slot, sink);
    SinkGuard {
        previous: Some(previous),
    }
}

/// Emits one event to the installed sink.
pub fn emit(event: &CacheEvent) {
    let sink = GLOBAL_SINK
        .read()
        .expect("event sink lock poisoned")
        .clone();
    sink.record(event);
}

/// A sink that buffers events for assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<CacheEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events
            .lock()
            .expect("recording sink mutex poisoned")
            .clone()
    }
}

impl CacheEventSink for RecordingSink {
    fn record(&self, event: &CacheEvent) {
        self.events
            .lock()
            .expect("recording sink mutex poisoned")
            .push(event.clone());
    }
}
