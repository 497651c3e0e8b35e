//! Destinations for failure records.

use super::collector::ActiveCollector;
use super::types::FailureRecord;
use crate::error::CoreError;
use crate::protocol::Operation;
use crate::router::Upstream;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Receives every record a reporter emits.
///
/// Called synchronously from `report`; implementations must not block for
/// long.
pub trait FailureSink: Send + Sync {
    fn name(&self) -> &str;

    fn accept(&self, record: &FailureRecord) -> Result<(), CoreError>;

    /// Also receive records past the reporter's cap.
    fn past_cap(&self) -> bool {
        false
    }
}

/// Persists one JSON file per record, written atomically.
///
/// Files are named `{origin}-{sequence}.failure`; a reader never observes a
/// partially written file because each one is renamed into place.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(record: &FailureRecord) -> String {
        format!("{}-{}.failure", record.origin, record.sequence)
    }
}

impl FailureSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn accept(&self, record: &FailureRecord) -> Result<(), CoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(Self::file_name(record)))
            .map_err(|e| CoreError::Io(e.error))?;
        Ok(())
    }
}

/// Sends records toward the coordinator as FAILURE notifications.
pub struct ForwardSink {
    upstream: Upstream,
}

impl ForwardSink {
    pub fn new(upstream: Upstream) -> Self {
        Self { upstream }
    }
}

impl FailureSink for ForwardSink {
    fn name(&self) -> &str {
        "forward"
    }

    fn accept(&self, record: &FailureRecord) -> Result<(), CoreError> {
        self.upstream
            .send(Operation::Failure(record.clone()))
            .map_err(CoreError::Transport)
    }
}

/// Feeds records into the coordinator's active run collector.
pub struct CollectorSink {
    active: Arc<ActiveCollector>,
}

impl CollectorSink {
    pub fn new(active: Arc<ActiveCollector>) -> Self {
        Self { active }
    }
}

impl FailureSink for CollectorSink {
    fn name(&self) -> &str {
        "collector"
    }

    fn accept(&self, record: &FailureRecord) -> Result<(), CoreError> {
        self.active.record(record.clone());
        Ok(())
    }

    /// The run's verdict depends on every fault, emitted or not.
    fn past_cap(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{FailureReporter, FailureType};
    use crate::failure::FailureCollector;
    use stampede_env::SimulatorAddress;

    #[test]
    fn test_file_sink_writes_one_file_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FailureReporter::shared(SimulatorAddress::worker(1, 3));
        reporter.add_sink(Arc::new(FileSink::new(dir.path()).unwrap()));

        reporter.report(crate::failure::FailureCause::Panic("x".into()), Some("t"));
        reporter.report(crate::failure::FailureCause::ProcessExit { code: 1 }, None);

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["A1_W3-1.failure", "A1_W3-2.failure"]);

        let text = std::fs::read_to_string(dir.path().join("A1_W3-2.failure")).unwrap();
        let record: FailureRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(record.failure_type, FailureType::AbnormalExit);
    }

    #[test]
    fn test_file_sink_error_does_not_escape_reporter() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("failures")).unwrap();
        std::fs::remove_dir_all(sink.dir()).unwrap();

        let reporter = FailureReporter::shared(SimulatorAddress::agent(1));
        reporter.add_sink(Arc::new(sink));
        assert!(reporter
            .report(crate::failure::FailureCause::Protocol("bad".into()), None)
            .is_some());
    }

    #[test]
    fn test_collector_sink_feeds_active_run() {
        let active = Arc::new(ActiveCollector::new());
        let collector = Arc::new(FailureCollector::new([FailureType::ProtocolError]));
        active.set(Arc::clone(&collector));

        let reporter = FailureReporter::shared(SimulatorAddress::COORDINATOR);
        reporter.add_sink(Arc::new(CollectorSink::new(Arc::clone(&active))));
        reporter.report(crate::failure::FailureCause::Protocol("bad tag".into()), None);
        reporter.report(crate::failure::FailureCause::Panic("boom".into()), Some("t"));

        let summary = collector.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.critical, 1);
    }

    #[test]
    fn test_collector_sink_sees_faults_past_cap() {
        let dir = tempfile::tempdir().unwrap();
        let active = Arc::new(ActiveCollector::new());
        let collector = Arc::new(FailureCollector::new(Vec::<FailureType>::new()));
        active.set(Arc::clone(&collector));

        let reporter = FailureReporter::new(
            SimulatorAddress::COORDINATOR,
            crate::failure::ReporterConfig::default().with_cap(1),
        );
        reporter.add_sink(Arc::new(FileSink::new(dir.path()).unwrap()));
        reporter.add_sink(Arc::new(CollectorSink::new(Arc::clone(&active))));
        for _ in 0..3 {
            reporter.report(crate::failure::FailureCause::Protocol("bad tag".into()), None);
        }

        assert_eq!(collector.summary().total, 3);
        assert_eq!(collector.critical_count(), 3);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
