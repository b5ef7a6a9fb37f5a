//! Statistics about the analyzers.
//!
//! The driver emits `(analyzer, duration)` events into an injected sink;
//! aggregation is the observer's concern, never process-global state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use snapls_std::hash::FxDashMap;

/// Receives analysis runtime events.
pub trait MetricsSink: Send + Sync {
    /// One analyzer finished on one package.
    fn analyzer_ran(&self, stable_name: &str, elapsed: Duration);
}

/// A sink that drops every event.
#[derive(Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn analyzer_ran(&self, _stable_name: &str, _elapsed: Duration) {}
}

#[derive(Clone)]
struct StatBucketData {
    runs: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl Default for StatBucketData {
    fn default() -> Self {
        Self {
            runs: 0,
            total: Duration::from_secs(0),
            min: Duration::from_secs(u64::MAX),
            max: Duration::from_secs(0),
        }
    }
}

/// Statistics about some analyzer
#[derive(Default, Clone)]
struct StatBucket {
    data: Arc<Mutex<StatBucketData>>,
}

/// Statistics about the analyzers.
#[derive(Default)]
pub struct AnalysisStats {
    buckets: FxDashMap<String, StatBucket>,
}

impl AnalysisStats {
    /// The number of runs recorded for one analyzer.
    pub fn runs_of(&self, stable_name: &str) -> u64 {
        self.buckets
            .get(stable_name)
            .map(|bucket| bucket.data.lock().runs)
            .unwrap_or_default()
    }

    /// The number of runs recorded across all analyzers.
    pub fn total_runs(&self) -> u64 {
        self.buckets
            .iter()
            .map(|bucket| bucket.data.lock().runs)
            .sum()
    }

    /// Report the statistics of the analysis.
    pub fn report(&self) -> String {
        let mut data: Vec<(String, StatBucketData)> = self
            .buckets
            .iter()
            .map(|refs| (refs.key().clone(), refs.value().data.lock().clone()))
            .collect();

        // sort by worst case
        data.sort_by(|x, y| y.1.max.cmp(&x.1.max));

        let mut out = String::new();
        for (name, bucket) in data {
            use std::fmt::Write;
            let _ = writeln!(
                out,
                "{name}: runs {}, total {:?}, min {:?}, max {:?}",
                bucket.runs, bucket.total, bucket.min, bucket.max
            );
        }
        out
    }
}

impl MetricsSink for AnalysisStats {
    fn analyzer_ran(&self, stable_name: &str, elapsed: Duration) {
        let bucket = self
            .buckets
            .entry(stable_name.to_string())
            .or_default()
            .clone();
        let mut data = bucket.data.lock();
        data.runs += 1;
        data.total += elapsed;
        data.min = data.min.min(elapsed);
        data.max = data.max.max(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregates_runs() {
        let stats = AnalysisStats::default();
        stats.analyzer_ran("nilness(a.rs:1)", Duration::from_millis(3));
        stats.analyzer_ran("nilness(a.rs:1)", Duration::from_millis(5));
        assert_eq!(stats.runs_of("nilness(a.rs:1)"), 2);
        assert_eq!(stats.total_runs(), 2);
        assert!(stats.report().contains("runs 2"));
    }
}
