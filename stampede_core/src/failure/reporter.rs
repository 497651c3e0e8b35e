//! Process-local failure reporter.

use super::sinks::FailureSink;
use super::types::{FailureCause, FailureRecord};
use crossbeam::queue::SegQueue;
use stampede_env::SimulatorAddress;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Records emitted per process before the reporter degrades to counting.
pub const DEFAULT_FAILURE_CAP: u64 = 1000;

/// Configuration for a [`FailureReporter`].
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Records emitted before further faults are only counted
    pub cap: u64,
    /// Keep emitted records for [`FailureReporter::drain`]
    pub buffer_records: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            cap: DEFAULT_FAILURE_CAP,
            buffer_records: true,
        }
    }
}

impl ReporterConfig {
    pub fn with_cap(mut self, cap: u64) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_buffer(mut self, buffer_records: bool) -> Self {
        self.buffer_records = buffer_records;
        self
    }
}

/// Classifies faults into records and hands them to sinks.
///
/// Every fault is counted. Only the first `cap` become records, so the
/// buffer and the sinks see bounded volume no matter how many faults occur.
/// `report` never fails: sink errors are logged and dropped.
pub struct FailureReporter {
    origin: SimulatorAddress,
    config: ReporterConfig,
    seen: AtomicU64,
    cap_warned: AtomicBool,
    buffer: SegQueue<FailureRecord>,
    sinks: RwLock<Vec<Arc<dyn FailureSink>>>,
}

impl FailureReporter {
    pub fn new(origin: SimulatorAddress, config: ReporterConfig) -> Self {
        Self {
            origin,
            config,
            seen: AtomicU64::new(0),
            cap_warned: AtomicBool::new(false),
            buffer: SegQueue::new(),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Creates an Arc-wrapped reporter with default settings.
    pub fn shared(origin: SimulatorAddress) -> Arc<Self> {
        Arc::new(Self::new(origin, ReporterConfig::default()))
    }

    pub fn origin(&self) -> SimulatorAddress {
        self.origin
    }

    pub fn add_sink(&self, sink: Arc<dyn FailureSink>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Reports a fault observed at this reporter's origin.
    pub fn report(&self, cause: FailureCause, test_id: Option<&str>) -> Option<FailureRecord> {
        self.report_for(self.origin, cause, test_id)
    }

    /// Reports a fault concerning another endpoint, e.g. an unresponsive worker.
    ///
    /// Returns the record, or `None` once the cap has been reached.
    pub fn report_for(
        &self,
        origin: SimulatorAddress,
        cause: FailureCause,
        test_id: Option<&str>,
    ) -> Option<FailureRecord> {
        let (record, emitted) = self.capture_for(origin, cause, test_id);
        emitted.then_some(record)
    }

    /// Like [`report`](Self::report), but always returns the record.
    pub fn capture(&self, cause: FailureCause, test_id: Option<&str>) -> (FailureRecord, bool) {
        self.capture_for(self.origin, cause, test_id)
    }

    /// Builds the record for a fault whether or not it is emitted.
    ///
    /// The flag tells whether the record went to the buffer and the sinks;
    /// past the cap it is counted only. Callers that classify faults use
    /// the record either way.
    pub fn capture_for(
        &self,
        origin: SimulatorAddress,
        cause: FailureCause,
        test_id: Option<&str>,
    ) -> (FailureRecord, bool) {
        let sequence = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        let failure_type = cause.classify();
        let record = FailureRecord {
            failure_type,
            origin,
            test_id: test_id.map(str::to_string),
            message: cause.message(),
            cause: cause.detail(),
            sequence,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            exit_code: cause.exit_code(),
        };

        if sequence > self.config.cap {
            if !self.cap_warned.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    origin = %self.origin,
                    cap = self.config.cap,
                    "failure cap reached, further failures are counted but not reported"
                );
            }
            self.feed(&record, |sink| sink.past_cap());
            return (record, false);
        }

        tracing::warn!(
            origin = %record.origin,
            test_id = ?record.test_id,
            failure_type = %failure_type,
            sequence,
            message = %record.message,
            "failure reported"
        );

        if self.config.buffer_records {
            self.buffer.push(record.clone());
        }

        self.feed(&record, |_| true);
        (record, true)
    }

    fn feed(&self, record: &FailureRecord, wanted: impl Fn(&dyn FailureSink) -> bool) {
        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for sink in sinks.iter().filter(|sink| wanted(sink.as_ref())) {
            if let Err(e) = sink.accept(record) {
                tracing::error!(sink = sink.name(), sequence = record.sequence, error = %e, "failure sink rejected record");
            }
        }
    }

    /// Returns and clears buffered records, oldest first.
    pub fn drain(&self) -> Vec<FailureRecord> {
        let mut records = Vec::with_capacity(self.buffer.len());
        while let Some(record) = self.buffer.pop() {
            records.push(record);
        }
        records
    }

    /// Faults seen, including those past the cap.
    pub fn total_count(&self) -> u64 {
        self.seen.load(Ordering::SeqCst)
    }

    /// Faults that became records.
    pub fn emitted_count(&self) -> u64 {
        self.total_count().min(self.config.cap)
    }

    pub fn is_capped(&self) -> bool {
        self.total_count() > self.config.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreError, WorkloadError};
    use crate::failure::FailureType;
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<u64>>);

    impl FailureSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn accept(&self, record: &FailureRecord) -> Result<(), CoreError> {
            self.0.lock().unwrap().push(record.sequence);
            Ok(())
        }
    }

    struct BrokenSink;

    impl FailureSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        fn accept(&self, _record: &FailureRecord) -> Result<(), CoreError> {
            Err(CoreError::config("disk on fire"))
        }
    }

    fn cause() -> FailureCause {
        FailureCause::Workload(WorkloadError::failed("boom"))
    }

    #[test]
    fn test_sequence_and_classification() {
        let reporter = FailureReporter::shared(SimulatorAddress::worker(1, 2));
        let first = reporter.report(cause(), Some("t1")).unwrap();
        let second = reporter
            .report(FailureCause::ProcessExit { code: 3 }, None)
            .unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(first.failure_type, FailureType::Exception);
        assert_eq!(first.test_id.as_deref(), Some("t1"));
        assert_eq!(first.origin, SimulatorAddress::worker(1, 2));
        assert_eq!(second.sequence, 2);
        assert_eq!(second.exit_code, Some(3));
    }

    #[test]
    fn test_cap_counts_without_emitting() {
        let reporter = FailureReporter::new(
            SimulatorAddress::worker(1, 1),
            ReporterConfig::default().with_cap(5),
        );
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        reporter.add_sink(sink.clone());

        let emitted = (0..20)
            .filter_map(|_| reporter.report(cause(), None))
            .count();

        assert_eq!(emitted, 5);
        assert_eq!(reporter.total_count(), 20);
        assert_eq!(reporter.emitted_count(), 5);
        assert!(reporter.is_capped());
        assert_eq!(sink.0.lock().unwrap().len(), 5);
        assert_eq!(reporter.drain().len(), 5);
    }

    #[test]
    fn test_drain_clears_buffer() {
        let reporter = FailureReporter::shared(SimulatorAddress::agent(1));
        reporter.report(cause(), None);
        reporter.report(cause(), None);

        let drained = reporter.drain();
        assert_eq!(drained.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert!(reporter.drain().is_empty());
    }

    #[test]
    fn test_sink_errors_are_swallowed() {
        let reporter = FailureReporter::shared(SimulatorAddress::agent(1));
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        reporter.add_sink(Arc::new(BrokenSink));
        reporter.add_sink(sink.clone());

        assert!(reporter.report(cause(), None).is_some());
        assert_eq!(*sink.0.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_concurrent_reports_get_distinct_sequences() {
        let reporter = FailureReporter::shared(SimulatorAddress::worker(1, 1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reporter = Arc::clone(&reporter);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        reporter.report(cause(), None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut sequences: Vec<u64> = reporter.drain().iter().map(|r| r.sequence).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=400).collect::<Vec<u64>>());
    }

    #[test]
    fn test_capture_past_cap_still_builds_record() {
        let reporter = FailureReporter::new(
            SimulatorAddress::COORDINATOR,
            ReporterConfig::default().with_cap(1),
        );
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        reporter.add_sink(sink.clone());

        let (first, emitted) = reporter.capture(cause(), Some("t1"));
        assert!(emitted);
        assert_eq!(first.sequence, 1);

        let (second, emitted) = reporter.capture(FailureCause::ProcessExit { code: 9 }, Some("t2"));
        assert!(!emitted);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.failure_type, FailureType::AbnormalExit);
        assert_eq!(second.test_id.as_deref(), Some("t2"));

        assert_eq!(*sink.0.lock().unwrap(), vec![1]);
        assert_eq!(reporter.drain().len(), 1);
        assert!(reporter.is_capped());
    }

    #[test]
    fn test_report_for_other_origin() {
        let reporter = FailureReporter::shared(SimulatorAddress::agent(2));
        let worker = SimulatorAddress::worker(2, 4);
        let record = reporter
            .report_for(worker, FailureCause::Unresponsive(worker), None)
            .unwrap();
        assert_eq!(record.origin, worker);
        assert!(record.failure_type.is_terminal());
    }
}
