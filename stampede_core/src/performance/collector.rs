//! Coordinator-side store of the latest sample per worker and test.

use super::sample::PerformanceSample;
use dashmap::DashMap;
use stampede_env::SimulatorAddress;

/// Keeps the most recent sample reported by each worker for each test.
#[derive(Debug, Default)]
pub struct PerformanceCollector {
    latest: DashMap<(String, SimulatorAddress), PerformanceSample>,
}

impl PerformanceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the worker's previous sample for the test.
    pub fn update(&self, test_id: &str, worker: SimulatorAddress, sample: PerformanceSample) {
        self.latest.insert((test_id.to_string(), worker), sample);
    }

    /// Merges the latest sample of every worker running the test.
    pub fn aggregate(&self, test_id: &str) -> PerformanceSample {
        let mut entries: Vec<(SimulatorAddress, PerformanceSample)> = self
            .latest
            .iter()
            .filter(|entry| entry.key().0 == test_id)
            .map(|entry| (entry.key().1, entry.value().clone()))
            .collect();
        entries.sort_by_key(|(worker, _)| *worker);

        entries
            .iter()
            .fold(PerformanceSample::empty(), |acc, (_, sample)| acc.combine(sample, true))
    }

    /// Number of workers that reported for the test.
    pub fn reporters(&self, test_id: &str) -> usize {
        self.latest.iter().filter(|e| e.key().0 == test_id).count()
    }

    pub fn clear(&self, test_id: &str) {
        self.latest.retain(|key, _| key.0 != test_id);
    }
}
