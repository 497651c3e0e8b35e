//! Worker-side conversion of probe snapshots into samples.

use super::probe::Probe;
use super::sample::PerformanceSample;
use std::time::Instant;

/// Tracks interval boundaries for one probe.
#[derive(Debug)]
pub struct PerformanceTracker {
    started: Instant,
    last_sample: Instant,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_sample: now,
        }
    }

    /// Restarts the run clock, e.g. when the RUN phase begins.
    pub fn restart(&mut self) {
        *self = Self::new();
    }

    /// Snapshots the probe and returns the sample for the elapsed interval.
    pub fn sample(&mut self, probe: &Probe) -> PerformanceSample {
        let now = Instant::now();
        let snapshot = probe.snapshot();
        let sample = PerformanceSample::from_snapshot(
            &snapshot,
            now - self.last_sample,
            now - self.started,
        );
        self.last_sample = now;
        sample
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_consecutive_samples_split_intervals() {
        let probe = Probe::new("op").unwrap();
        let mut tracker = PerformanceTracker::new();

        for _ in 0..4 {
            probe.record(Duration::from_micros(10));
        }
        std::thread::sleep(Duration::from_millis(5));
        let first = tracker.sample(&probe);
        assert_eq!(first.interval_operation_count, 4);
        assert!(first.interval_throughput > 0.0);

        probe.record(Duration::from_micros(10));
        let second = tracker.sample(&probe);
        assert_eq!(second.interval_operation_count, 1);
        assert_eq!(second.operation_count, 5);
    }
}
