//! Stampede Simulation Harness
//!
//! Runs a complete Stampede cluster inside one process so orchestration
//! behaviour can be exercised end to end:
//! - **Cluster**: one coordinator, N agents, M workers per agent, wired
//!   with in-memory channels (fault-injectable) or loopback TCP
//! - **Workloads**: built-in workloads that succeed, fail, hang, record
//!   their phases or flood failures
//! - **Scenarios**: a fresh cluster per scenario, with the expected
//!   outcome checked after the run
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── SimWorld ────────────────────────────┐
//! │                    Coordinator (C) + PhaseOrchestrator           │
//! │                      ▲                      ▲                    │
//! │              channel │ / tcp        channel │ / tcp              │
//! │                ┌─────┴─────┐          ┌─────┴─────┐              │
//! │                │  Agent A1 │   ...    │  Agent An │              │
//! │                └──┬─────┬──┘          └──┬─────┬──┘              │
//! │                A1_W1  A1_W2    ...    An_W1  An_W2               │
//! │              (WorkerRuntime + built-in workloads)                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stampede_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42).with_agents(2);
//! let result = runner.run(ScenarioId::CriticalFailure).await;
//! assert!(result.passed);
//! ```

mod error;
mod exporter;
mod runner;
mod world;
pub mod scenarios;
pub mod workloads;

pub use error::SimError;
pub use exporter::SimExport;
pub use runner::{ScenarioResult, ScenarioRunner};
pub use world::{LinkKind, SimConfig, SimWorld};
