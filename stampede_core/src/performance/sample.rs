//! Mergeable performance samples.

use super::probe::ProbeSnapshot;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Throughput and latency of one worker (or a merge of several) over an interval.
///
/// Cumulative fields cover the whole run; interval fields cover the time
/// since the previous sample. The all-zero sample is the identity of
/// [`combine`](PerformanceSample::combine).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Operations since the start of the run (cumulative)
    pub operation_count: u64,
    pub interval_operation_count: u64,
    /// Operations per second over the interval
    pub interval_throughput: f64,
    /// Operations per second since the start of the run (cumulative)
    pub total_throughput: f64,
    pub interval_latency_sum_nanos: u64,
    pub interval_latency_p999_nanos: u64,
    pub interval_latency_max_nanos: u64,
}

impl PerformanceSample {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.operation_count == 0
            && self.interval_operation_count == 0
            && self.interval_throughput == 0.0
            && self.total_throughput == 0.0
            && self.interval_latency_sum_nanos == 0
            && self.interval_latency_p999_nanos == 0
            && self.interval_latency_max_nanos == 0
    }

    /// Builds a sample from a probe snapshot.
    ///
    /// `interval` is the time covered by the snapshot, `elapsed` the time
    /// since the run started.
    pub fn from_snapshot(snapshot: &ProbeSnapshot, interval: Duration, elapsed: Duration) -> Self {
        let histogram = &snapshot.histogram;
        let interval_operation_count = histogram.len();
        let (p999, max) = if histogram.is_empty() {
            (0, 0)
        } else {
            (histogram.value_at_quantile(0.999), histogram.max())
        };

        Self {
            operation_count: snapshot.operation_count,
            interval_operation_count,
            interval_throughput: per_second(interval_operation_count, interval),
            total_throughput: per_second(snapshot.operation_count, elapsed),
            interval_latency_sum_nanos: snapshot.latency_sum_nanos,
            interval_latency_p999_nanos: p999,
            interval_latency_max_nanos: max,
        }
    }

    /// Merges two samples.
    ///
    /// Interval counts, throughput and latency sums add; p999 and max take
    /// the larger value. Cumulative fields add when `include_cumulative` is
    /// set and are otherwise taken from `self`. Either side being empty
    /// yields the other unchanged.
    pub fn combine(&self, other: &PerformanceSample, include_cumulative: bool) -> PerformanceSample {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }

        let (operation_count, total_throughput) = if include_cumulative {
            (
                self.operation_count.saturating_add(other.operation_count),
                self.total_throughput + other.total_throughput,
            )
        } else {
            (self.operation_count, self.total_throughput)
        };

        PerformanceSample {
            operation_count,
            interval_operation_count: self
                .interval_operation_count
                .saturating_add(other.interval_operation_count),
            interval_throughput: self.interval_throughput + other.interval_throughput,
            total_throughput,
            interval_latency_sum_nanos: self
                .interval_latency_sum_nanos
                .saturating_add(other.interval_latency_sum_nanos),
            interval_latency_p999_nanos: self
                .interval_latency_p999_nanos
                .max(other.interval_latency_p999_nanos),
            interval_latency_max_nanos: self
                .interval_latency_max_nanos
                .max(other.interval_latency_max_nanos),
        }
    }

    /// Mean interval latency, or 0 when nothing was recorded.
    pub fn interval_latency_avg_nanos(&self) -> f64 {
        if self.interval_operation_count == 0 {
            0.0
        } else {
            self.interval_latency_sum_nanos as f64 / self.interval_operation_count as f64
        }
    }
}

fn per_second(count: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs <= 0.0 {
        0.0
    } else {
        count as f64 / secs
    }
}
