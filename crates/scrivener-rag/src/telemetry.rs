//! Telemetry sink: counters, per-stage latency, structured events.
//!
//! The default implementation writes through tracing and keeps counter
//! totals in process for the stats surface.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

pub trait Telemetry: Send + Sync {
    fn incr(&self, counter: &'static str, by: u64);

    fn record_latency(&self, stage: &'static str, elapsed: Duration);

    fn event(&self, name: &'static str, fields: &[(&'static str, String)]);
}

pub struct TracingTelemetry {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl TracingTelemetry {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn counter(&self, name: &'static str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counters.lock().clone()
    }
}

impl Default for TracingTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry for TracingTelemetry {
    fn incr(&self, counter: &'static str, by: u64) {
        *self.counters.lock().entry(counter).or_insert(0) += by;
    }

    fn record_latency(&self, stage: &'static str, elapsed: Duration) {
        tracing::debug!(stage = stage, elapsed_ms = elapsed.as_millis() as u64, "stage latency");
    }

    fn event(&self, name: &'static str, fields: &[(&'static str, String)]) {
        tracing::info!(event = name, fields = ?fields, "telemetry event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let telemetry = TracingTelemetry::new();
        telemetry.incr("requests", 1);
        telemetry.incr("requests", 2);
        telemetry.incr("errors.validation_error", 1);
        assert_eq!(telemetry.counter("requests"), 3);
        assert_eq!(telemetry.counter("errors.validation_error"), 1);
        assert_eq!(telemetry.counter("unknown"), 0);
    }
}
