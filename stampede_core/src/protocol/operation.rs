//! Operation payloads carried by envelopes.

use crate::error::TransportError;
use crate::failure::FailureRecord;
use crate::performance::PerformanceSample;
use crate::phase::TestPhase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Description of a test to be hosted by workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Unique id of the test within a run
    pub test_id: String,
    /// Workload name resolved through the worker's registry
    pub workload: String,
    /// Free-form properties handed to the workload
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl TestSpec {
    pub fn new(test_id: impl Into<String>, workload: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            workload: workload.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Adds a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(key.into(), value.to_string());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Number of iteration threads per worker (`threadCount`, default 1).
    pub fn thread_count(&self) -> usize {
        self.property("threadCount")
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1)
    }
}

/// Outcome status carried by a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyStatus {
    Success,
    UnsupportedOperation,
    AgentNotFound,
    WorkerNotFound,
    TestNotFound,
    Exception,
    Timeout,
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplyStatus::Success => "SUCCESS",
            ReplyStatus::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            ReplyStatus::AgentNotFound => "AGENT_NOT_FOUND",
            ReplyStatus::WorkerNotFound => "WORKER_NOT_FOUND",
            ReplyStatus::TestNotFound => "TEST_NOT_FOUND",
            ReplyStatus::Exception => "EXCEPTION",
            ReplyStatus::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Result of handling a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub payload: Option<String>,
}

impl Reply {
    pub fn success() -> Self {
        Self {
            status: ReplyStatus::Success,
            payload: None,
        }
    }

    pub fn success_with(payload: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Success,
            payload: Some(payload.into()),
        }
    }

    pub fn error(status: ReplyStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }

    /// Converts a non-success reply into [`TransportError::Remote`].
    pub fn into_result(self) -> Result<Option<String>, TransportError> {
        if self.is_success() {
            Ok(self.payload)
        } else {
            Err(TransportError::Remote {
                status: self.status,
                message: self.payload.unwrap_or_default(),
            })
        }
    }
}

/// Every message the hierarchy exchanges.
///
/// Adding an operation means adding a variant here, its tag to
/// [`Operation::TAGS`], and an arm in each runtime's handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Instantiate a test on a worker
    CreateTest { test_index: u32, spec: TestSpec },
    /// Run one lifecycle phase of a test
    StartPhase { test_id: String, phase: TestPhase },
    /// Stop the RUN phase workload threads
    StopRun { test_id: String },
    /// Shut down the receiving process
    Terminate { graceful: bool },
    /// Run a shell script on an agent
    ExecuteScript { script: String, fire_and_forget: bool },
    /// Worker notification that a phase finished
    PhaseCompleted { test_id: String, phase: TestPhase },
    /// Periodic performance sample from a worker
    PerformanceStats {
        test_id: String,
        sample: PerformanceSample,
    },
    /// Fault record travelling toward the coordinator
    Failure(FailureRecord),
    /// Liveness check
    Ping,
    /// Response payload
    Reply(Reply),
}

impl Operation {
    /// Every tag this build understands.
    pub const TAGS: [&'static str; 10] = [
        "CREATE_TEST",
        "START_PHASE",
        "STOP_RUN",
        "TERMINATE",
        "EXECUTE_SCRIPT",
        "PHASE_COMPLETED",
        "PERFORMANCE_STATS",
        "FAILURE",
        "PING",
        "REPLY",
    ];

    /// Wire tag of this operation.
    pub fn tag(&self) -> &'static str {
        match self {
            Operation::CreateTest { .. } => "CREATE_TEST",
            Operation::StartPhase { .. } => "START_PHASE",
            Operation::StopRun { .. } => "STOP_RUN",
            Operation::Terminate { .. } => "TERMINATE",
            Operation::ExecuteScript { .. } => "EXECUTE_SCRIPT",
            Operation::PhaseCompleted { .. } => "PHASE_COMPLETED",
            Operation::PerformanceStats { .. } => "PERFORMANCE_STATS",
            Operation::Failure(_) => "FAILURE",
            Operation::Ping => "PING",
            Operation::Reply(_) => "REPLY",
        }
    }

    pub fn is_supported_tag(tag: &str) -> bool {
        Self::TAGS.contains(&tag)
    }
}
