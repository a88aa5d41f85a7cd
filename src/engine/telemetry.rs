// Telemetry seam for event, lock and action counters

//! # Telemetry Module
//!
//! The runtime reports what it does (events dispatched, lock operations, action outcomes)
//! through the [`Telemetry`] trait and never depends on a concrete metrics backend.
//!
//! - [`TracingTelemetry`] writes every sample as a `tracing` debug event. It is the default.
//! - [`InMemoryTelemetry`] counts samples in a `DashMap`, which tests read back.

use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

/// Receiver of runtime counters and timings
pub trait Telemetry: Send + Sync {
    /// An element event was dispatched; `handled` is false when no handler exists
    fn record_event(&self, event_type: &str, handled: bool);

    /// A lock operation finished with the given outcome (`acquired`, `conflict`, ...)
    fn record_lock_operation(&self, operation: &str, outcome: &str);

    fn record_action(&self, kind: &str, success: bool);

    fn record_timing(&self, operation: &str, elapsed: Duration);
}

/// Telemetry that logs through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn record_event(&self, event_type: &str, handled: bool) {
        debug!(target: "canvas_runtime::telemetry", event_type, handled, "event dispatched");
    }

    fn record_lock_operation(&self, operation: &str, outcome: &str) {
        debug!(target: "canvas_runtime::telemetry", operation, outcome, "lock operation");
    }

    fn record_action(&self, kind: &str, success: bool) {
        debug!(target: "canvas_runtime::telemetry", kind, success, "action executed");
    }

    fn record_timing(&self, operation: &str, elapsed: Duration) {
        debug!(
            target: "canvas_runtime::telemetry",
            operation,
            elapsed_us = elapsed.as_micros() as u64,
            "timing"
        );
    }
}

/// Telemetry that keeps counters in memory
///
/// Counter names are dotted paths: `event.<type>.handled`, `event.<type>.unhandled`,
/// `lock.<operation>.<outcome>`, `action.<kind>.ok`, `action.<kind>.failed` and
/// `timing.<operation>` (number of samples).
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    counters: DashMap<String, u64>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut counters: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        counters.sort();
        counters
    }

    fn bump(&self, name: String) {
        *self.counters.entry(name).or_insert(0) += 1;
    }
}

impl Telemetry for InMemoryTelemetry {
    fn record_event(&self, event_type: &str, handled: bool) {
        let suffix = if handled { "handled" } else { "unhandled" };
        self.bump(format!("event.{}.{}", event_type, suffix));
    }

    fn record_lock_operation(&self, operation: &str, outcome: &str) {
        self.bump(format!("lock.{}.{}", operation, outcome));
    }

    fn record_action(&self, kind: &str, success: bool) {
        let suffix = if success { "ok" } else { "failed" };
        self.bump(format!("action.{}.{}", kind, suffix));
    }

    fn record_timing(&self, operation: &str, _elapsed: Duration) {
        self.bump(format!("timing.{}", operation));
    }
}
