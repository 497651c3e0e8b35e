//! Failure classification types.

use crate::error::WorkloadError;
use serde::{Deserialize, Serialize};
use stampede_env::SimulatorAddress;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Classification of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// Workload code raised an error or panicked
    Exception,
    /// A request or phase did not complete in time
    Timeout,
    OutOfMemory,
    /// Worker process exited with a non-zero code
    AbnormalExit,
    /// Worker process exited cleanly while it was still needed
    NormalExit,
    /// A test could not be instantiated
    CreateError,
    /// Undecodable or unsupported message, or an error reply
    ProtocolError,
    /// Worker stopped answering heartbeat pings
    WorkerUnresponsive,
}

impl FailureType {
    pub const ALL: [FailureType; 8] = [
        FailureType::Exception,
        FailureType::Timeout,
        FailureType::OutOfMemory,
        FailureType::AbnormalExit,
        FailureType::NormalExit,
        FailureType::CreateError,
        FailureType::ProtocolError,
        FailureType::WorkerUnresponsive,
    ];

    /// True if the failing worker is gone and will send nothing more.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FailureType::OutOfMemory
                | FailureType::AbnormalExit
                | FailureType::NormalExit
                | FailureType::WorkerUnresponsive
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            FailureType::Exception => "EXCEPTION",
            FailureType::Timeout => "TIMEOUT",
            FailureType::OutOfMemory => "OUT_OF_MEMORY",
            FailureType::AbnormalExit => "ABNORMAL_EXIT",
            FailureType::NormalExit => "NORMAL_EXIT",
            FailureType::CreateError => "CREATE_ERROR",
            FailureType::ProtocolError => "PROTOCOL_ERROR",
            FailureType::WorkerUnresponsive => "WORKER_UNRESPONSIVE",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FailureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_");
        Self::ALL
            .iter()
            .find(|t| t.name().eq_ignore_ascii_case(&normalized))
            .copied()
            .ok_or_else(|| format!("unknown failure type: {}", s))
    }
}

/// What went wrong, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    Workload(WorkloadError),
    /// Panic payload text
    Panic(String),
    Timeout { what: String, after: Duration },
    ProcessExit { code: i32 },
    CreateFailed(String),
    Protocol(String),
    Unresponsive(SimulatorAddress),
}

impl FailureCause {
    pub fn classify(&self) -> FailureType {
        match self {
            FailureCause::Workload(WorkloadError::OutOfMemory(_)) => FailureType::OutOfMemory,
            FailureCause::Workload(WorkloadError::Timeout(_)) => FailureType::Timeout,
            FailureCause::Workload(WorkloadError::UnknownWorkload(_)) => FailureType::CreateError,
            FailureCause::Workload(_) | FailureCause::Panic(_) => FailureType::Exception,
            FailureCause::Timeout { .. } => FailureType::Timeout,
            FailureCause::ProcessExit { code: 0 } => FailureType::NormalExit,
            FailureCause::ProcessExit { .. } => FailureType::AbnormalExit,
            FailureCause::CreateFailed(_) => FailureType::CreateError,
            FailureCause::Protocol(_) => FailureType::ProtocolError,
            FailureCause::Unresponsive(_) => FailureType::WorkerUnresponsive,
        }
    }

    /// One-line message for the record.
    pub fn message(&self) -> String {
        match self {
            FailureCause::Workload(e) => e.to_string(),
            FailureCause::Panic(msg) => format!("panicked: {}", msg),
            FailureCause::Timeout { what, after } => format!("{} timed out after {:?}", what, after),
            FailureCause::ProcessExit { code } => format!("process exited with code {}", code),
            FailureCause::CreateFailed(msg) => format!("test creation failed: {}", msg),
            FailureCause::Protocol(msg) => format!("protocol error: {}", msg),
            FailureCause::Unresponsive(worker) => format!("{} stopped answering pings", worker),
        }
    }

    /// Detail text for the record.
    pub fn detail(&self) -> String {
        format!("{:?}", self)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            FailureCause::ProcessExit { code } => Some(*code),
            _ => None,
        }
    }
}

impl From<WorkloadError> for FailureCause {
    fn from(e: WorkloadError) -> Self {
        FailureCause::Workload(e)
    }
}

/// A classified fault. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failure_type: FailureType,
    /// Endpoint where the fault was observed (or the worker it concerns)
    pub origin: SimulatorAddress,
    pub test_id: Option<String>,
    pub message: String,
    pub cause: String,
    /// Per-reporter sequence number, starting at 1
    pub sequence: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub exit_code: Option<i32>,
}

impl FailureRecord {
    /// True if the record concerns the given test; records without a test
    /// concern every test.
    pub fn affects_test(&self, test_id: &str) -> bool {
        self.test_id.as_deref().map_or(true, |id| id == test_id)
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} at {}", self.sequence, self.failure_type, self.origin)?;
        if let Some(test_id) = &self.test_id {
            write!(f, " [{}]", test_id)?;
        }
        write!(f, ": {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            FailureCause::Workload(WorkloadError::failed("x")).classify(),
            FailureType::Exception
        );
        assert_eq!(
            FailureCause::Workload(WorkloadError::OutOfMemory("heap".into())).classify(),
            FailureType::OutOfMemory
        );
        assert_eq!(FailureCause::Panic("p".into()).classify(), FailureType::Exception);
        assert_eq!(FailureCause::ProcessExit { code: 0 }.classify(), FailureType::NormalExit);
        assert_eq!(FailureCause::ProcessExit { code: 137 }.classify(), FailureType::AbnormalExit);
        assert_eq!(
            FailureCause::Unresponsive(SimulatorAddress::worker(1, 1)).classify(),
            FailureType::WorkerUnresponsive
        );
    }

    #[test]
    fn test_terminal_types() {
        assert!(FailureType::OutOfMemory.is_terminal());
        assert!(FailureType::AbnormalExit.is_terminal());
        assert!(!FailureType::Exception.is_terminal());
        assert!(!FailureType::Timeout.is_terminal());
    }

    #[test]
    fn test_type_parsing() {
        for t in FailureType::ALL {
            assert_eq!(t.name().parse::<FailureType>().unwrap(), t);
        }
        assert_eq!("out-of-memory".parse::<FailureType>().unwrap(), FailureType::OutOfMemory);
        assert!("meltdown".parse::<FailureType>().is_err());
    }

    #[test]
    fn test_record_without_test_affects_all() {
        let record = FailureRecord {
            failure_type: FailureType::Exception,
            origin: SimulatorAddress::worker(1, 1),
            test_id: None,
            message: String::new(),
            cause: String::new(),
            sequence: 1,
            timestamp_ms: 0,
            exit_code: None,
        };
        assert!(record.affects_test("anything"));
        let scoped = FailureRecord {
            test_id: Some("a".into()),
            ..record
        };
        assert!(scoped.affects_test("a"));
        assert!(!scoped.affects_test("b"));
    }
}
