//! Stampede Core - orchestration engine for distributed load tests
//!
//! A coordinator drives agents, each supervising workers that host tests
//! and hammer the system under test. This crate holds everything those
//! processes run:
//! 1. **Routing**: hierarchical addresses, JSON envelopes and a [`Router`]
//!    per process with promise-based request/response
//! 2. **Phases**: the ordered test lifecycle with completion barriers,
//!    driven by the [`PhaseOrchestrator`]
//! 3. **Failures**: capped reporting, pluggable sinks and critical/tolerable
//!    classification that aborts a run safely
//! 4. **Performance**: HDR latency probes, mergeable samples and metronomes
//!    for iteration pacing
//!
//! ```text
//!   Coordinator ──START_PHASE──► Agent ──► Worker ──► TestContainer
//!        ▲                                   │          (workload threads)
//!        └──── PHASE_COMPLETED / FAILURE / PERFORMANCE_STATS ◄┘
//! ```

pub mod agent;
pub mod coordinator;
pub mod error;
pub mod failure;
pub mod performance;
pub mod phase;
pub mod protocol;
pub mod router;
pub mod worker;

// Re-export key types for convenience
pub use agent::{AgentConfig, AgentRuntime};
pub use coordinator::{ComponentRegistry, Coordinator, CoordinatorConfig};
pub use error::{CodecError, CoreError, TransportError, WorkloadError};
pub use failure::{FailureCause, FailureRecord, FailureReporter, FailureType};
pub use performance::{PerformanceSample, Probe};
pub use phase::{PhaseOrchestrator, RunConfig, RunOutcome, TestPhase};
pub use protocol::{MessageEnvelope, Operation, Reply, ReplyStatus, TestSpec};
pub use router::{OperationHandler, Promise, Router, RouterConfig};
pub use worker::{IterationContext, TestContext, WorkerConfig, WorkerRuntime, Workload, WorkloadRegistry};
