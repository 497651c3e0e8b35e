//! Fault capture, classification and propagation.
//!
//! Workers and agents report faults through a [`FailureReporter`], which
//! turns each cause into an immutable [`FailureRecord`] and hands it to its
//! sinks (a file directory, the upstream link to the coordinator, the
//! coordinator's own collector). The coordinator feeds incoming records
//! into the run's [`FailureCollector`], which decides whether each one is
//! tolerable or critical.

mod collector;
mod reporter;
mod sinks;
mod types;

pub use collector::{ActiveCollector, FailureCollector, FailureSummary};
pub use reporter::{FailureReporter, ReporterConfig, DEFAULT_FAILURE_CAP};
pub use sinks::{CollectorSink, FailureSink, FileSink, ForwardSink};
pub use types::{FailureCause, FailureRecord, FailureType};
