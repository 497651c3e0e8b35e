//! Test lifecycle: phases, completion barriers and the orchestrator.

mod barrier;
mod config;
mod orchestrator;
mod test_phase;

pub use barrier::{BarrierOutcome, PhaseBarrier};
pub use config::{RunConfig, RunConfigBuilder};
pub use orchestrator::{PhaseOrchestrator, RunOutcome};
pub use test_phase::TestPhase;
