//! Metrics Emission
//!
//! The registry publishes gauge counts through an injected sink rather
//! than a process-global collector, so embedders pick the backend and
//! tests can assert on emitted values.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Receiver for gauge updates emitted by the registry.
pub trait MetricsSink: Send + Sync {
    /// Set the named gauge to the given value.
    fn gauge(&self, name: &str, value: i64);
}

/// Sink that discards every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn gauge(&self, _name: &str, _value: i64) {}
}

/// In-memory sink retaining the last value per gauge.
///
/// Used by tests and by embedders that expose a debug endpoint instead of
/// a full metrics pipeline.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    gauges: Mutex<HashMap<String, i64>>,
}

impl MemoryMetrics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the last value recorded for a gauge.
    pub fn get(&self, name: &str) -> Option<i64> {
        self.lock().get(name).copied()
    }

    /// Snapshot every recorded gauge.
    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        self.gauges.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetricsSink for MemoryMetrics {
    fn gauge(&self, name: &str, value: i64) {
        self.lock().insert(name.to_string(), value);
    }
}
