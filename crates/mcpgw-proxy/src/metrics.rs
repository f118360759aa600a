use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Per-tool latency samples are bounded to the most recent window rather
/// than kept unbounded (spec.md §8 Open Question: rolling samples, not a
/// full history).
const MAX_LATENCY_SAMPLES: usize = 100;

/// `getMetrics()` (spec.md §4.5): call counters plus rolling per-tool
/// latency, with no assumption of an external sink.
#[derive(Default)]
pub struct ProxyMetrics {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    latencies: Mutex<HashMap<String, Vec<u64>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub latency_by_tool_ms: HashMap<String, Vec<u64>>,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, tool: &str, succeeded: bool, latency_ms: u64) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }

        let mut latencies = self.latencies.lock().unwrap();
        let samples = latencies.entry(tool.to_string()).or_default();
        samples.push(latency_ms);
        if samples.len() > MAX_LATENCY_SAMPLES {
            samples.remove(0);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            latency_by_tool_ms: self.latencies.lock().unwrap().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_success_and_failure() {
        let metrics = ProxyMetrics::new();
        metrics.record_call("calc__add", true, 12);
        metrics.record_call("calc__add", false, 30);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 2);
        assert_eq!(snapshot.successful_calls, 1);
        assert_eq!(snapshot.failed_calls, 1);
        assert_eq!(snapshot.latency_by_tool_ms["calc__add"], vec![12, 30]);
    }

    #[test]
    fn latency_samples_are_capped_to_the_most_recent_window() {
        let metrics = ProxyMetrics::new();
        for i in 0..150u64 {
            metrics.record_call("echo", true, i);
        }

        let snapshot = metrics.snapshot();
        let samples = &snapshot.latency_by_tool_ms["echo"];
        assert_eq!(samples.len(), MAX_LATENCY_SAMPLES);
        assert_eq!(samples.first(), Some(&50));
        assert_eq!(samples.last(), Some(&149));
    }
}
