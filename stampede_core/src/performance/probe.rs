//! Per-operation latency recorder.

use crate::error::CoreError;
use hdrhistogram::Histogram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest recordable latency: 24 hours in nanoseconds.
pub const MAX_TRACKABLE_NANOS: u64 = 24 * 60 * 60 * 1_000_000_000;

/// Relative precision of recorded values.
pub const SIGNIFICANT_DIGITS: u8 = 3;

/// Wall-clock nanoseconds since the Unix epoch, the time base of [`Probe::done`].
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Latencies recorded since the last snapshot.
struct Interval {
    histogram: Histogram<u64>,
    latency_sum_nanos: u64,
}

/// Interval data handed out by [`Probe::snapshot`].
#[derive(Clone)]
pub struct ProbeSnapshot {
    pub histogram: Histogram<u64>,
    pub latency_sum_nanos: u64,
    /// Operations recorded over the probe's whole lifetime
    pub operation_count: u64,
}

/// Records latency observations into an HDR histogram.
///
/// Observations above [`MAX_TRACKABLE_NANOS`] are clamped to it. Negative
/// observations, which wall-clock adjustments can produce, are recorded by
/// magnitude and counted separately.
pub struct Probe {
    name: String,
    interval: Mutex<Interval>,
    operation_count: AtomicU64,
    negative_count: AtomicU64,
    clamped_count: AtomicU64,
}

impl Probe {
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let histogram = Histogram::new_with_bounds(1, MAX_TRACKABLE_NANOS, SIGNIFICANT_DIGITS)
            .map_err(|e| CoreError::config(format!("histogram bounds: {:?}", e)))?;
        Ok(Self {
            name: name.into(),
            interval: Mutex::new(Interval {
                histogram,
                latency_sum_nanos: 0,
            }),
            operation_count: AtomicU64::new(0),
            negative_count: AtomicU64::new(0),
            clamped_count: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records one latency observation in nanoseconds.
    pub fn record_nanos(&self, latency: i64) {
        let mut value = latency.unsigned_abs();
        if latency < 0 {
            self.negative_count.fetch_add(1, Ordering::Relaxed);
        }
        if value > MAX_TRACKABLE_NANOS {
            self.clamped_count.fetch_add(1, Ordering::Relaxed);
            value = MAX_TRACKABLE_NANOS;
        }

        let mut interval = self.interval.lock().unwrap_or_else(PoisonError::into_inner);
        interval.histogram.saturating_record(value);
        interval.latency_sum_nanos = interval.latency_sum_nanos.saturating_add(value);
        drop(interval);

        self.operation_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, latency: Duration) {
        self.record_nanos(i64::try_from(latency.as_nanos()).unwrap_or(i64::MAX));
    }

    /// Records the latency of an operation started at `start_nanos` (see [`now_nanos`]).
    pub fn done(&self, start_nanos: i64) -> Result<(), CoreError> {
        if start_nanos <= 0 {
            return Err(CoreError::invalid_argument(format!(
                "start time must be positive, got {}",
                start_nanos
            )));
        }
        self.record_nanos(now_nanos() - start_nanos);
        Ok(())
    }

    /// Takes the interval histogram, leaving an empty one in its place.
    pub fn snapshot(&self) -> ProbeSnapshot {
        let mut interval = self.interval.lock().unwrap_or_else(PoisonError::into_inner);
        let histogram = interval.histogram.clone();
        let latency_sum_nanos = interval.latency_sum_nanos;
        interval.histogram.reset();
        interval.latency_sum_nanos = 0;
        drop(interval);

        ProbeSnapshot {
            histogram,
            latency_sum_nanos,
            operation_count: self.operation_count.load(Ordering::Relaxed),
        }
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::Relaxed)
    }

    pub fn negative_count(&self) -> u64 {
        self.negative_count.load(Ordering::Relaxed)
    }

    pub fn clamped_count(&self) -> u64 {
        self.clamped_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    #[test]
    fn test_records_millisecond_latencies() {
        let probe = Probe::new("op").unwrap();
        for latency in [200 * MS, 500 * MS, 1000 * MS] {
            probe.record_nanos(latency);
        }

        let snapshot = probe.snapshot();
        assert_eq!(snapshot.histogram.len(), 3);
        for latency in [200 * MS, 500 * MS, 1000 * MS] {
            assert!(snapshot.histogram.count_at(latency as u64) > 0);
        }
        assert_eq!(snapshot.latency_sum_nanos, 1700 * MS as u64);
    }

    #[test]
    fn test_over_range_is_clamped() {
        let probe = Probe::new("op").unwrap();
        probe.record_nanos(i64::MAX);

        let snapshot = probe.snapshot();
        assert_eq!(snapshot.histogram.len(), 1);
        assert!(snapshot
            .histogram
            .equivalent(snapshot.histogram.max(), MAX_TRACKABLE_NANOS));
        assert_eq!(probe.clamped_count(), 1);
    }

    #[test]
    fn test_negative_latency_is_sign_corrected() {
        let probe = Probe::new("op").unwrap();
        probe.record_nanos(-5 * MS);

        assert_eq!(probe.negative_count(), 1);
        let snapshot = probe.snapshot();
        assert!(snapshot.histogram.count_at(5 * MS as u64) > 0);
    }

    #[test]
    fn test_done_rejects_non_positive_start() {
        let probe = Probe::new("op").unwrap();
        assert!(matches!(probe.done(0), Err(CoreError::InvalidArgument(_))));
        assert!(matches!(probe.done(-1), Err(CoreError::InvalidArgument(_))));
        assert_eq!(probe.operation_count(), 0);

        probe.done(now_nanos()).unwrap();
        assert_eq!(probe.operation_count(), 1);
    }

    #[test]
    fn test_snapshot_resets_interval() {
        let probe = Probe::new("op").unwrap();
        probe.record(Duration::from_millis(1));
        assert_eq!(probe.snapshot().histogram.len(), 1);

        let second = probe.snapshot();
        assert_eq!(second.histogram.len(), 0);
        assert_eq!(second.operation_count, 1);
    }
}
