//! Counters exposed to the observability collaborator.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine counters. Shared between the cache, the evaluator and the telemetry emitter.
#[derive(Debug, Default)]
pub struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    collapsed: AtomicU64,
    stale_fallbacks: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
    dropped_telemetry: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Cache lookups answered by a fresh entry.
    pub hits: u64,
    /// Cache lookups that needed a load (or joined one).
    pub misses: u64,
    /// Misses that joined an in-flight load instead of starting one.
    pub collapsed: u64,
    /// Times a stale value was served because a refresh failed or timed out.
    pub stale_fallbacks: u64,
    /// Loader invocations.
    pub loads: u64,
    /// Loader invocations that returned an error.
    pub load_failures: u64,
    /// Cache entries removed to stay under the size bound, or purged once expired.
    pub evictions: u64,
    /// Telemetry events dropped (buffer full, worker gone, or sink error).
    pub dropped_telemetry: u64,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collapsed(&self) {
        self.collapsed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_fallback(&self) {
        self.stale_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_telemetry(&self) {
        self.dropped_telemetry.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            collapsed: self.collapsed.load(Ordering::Relaxed),
            stale_fallbacks: self.stale_fallbacks.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            dropped_telemetry: self.dropped_telemetry.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Metrics;

    #[test]
    fn snapshot_serializes_camel_case() {
        let metrics = Metrics::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_dropped_telemetry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.dropped_telemetry, 1);

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["hits"], 2);
        assert_eq!(json["droppedTelemetry"], 1);
        assert_eq!(json["staleFallbacks"], 0);
    }
}
