//! Scenario runner - builds a cluster per scenario and checks the outcome.

use crate::error::SimError;
use crate::scenarios::ScenarioId;
use crate::workloads::{
    PROPERTY_FAIL_ITERATION, PROPERTY_FAIL_PHASE, PROPERTY_HANG_MS, PROPERTY_HANG_PHASE,
    PROPERTY_MEAN_LATENCY_US, PROPERTY_TARGET_WORKER,
};
use crate::world::{LinkKind, SimConfig, SimWorld};

use serde::Serialize;
use stampede_core::failure::FailureType;
use stampede_core::phase::{RunConfig, RunOutcome, TestPhase};
use stampede_core::protocol::TestSpec;
use stampede_core::worker::PROPERTY_TOTAL_THROUGHPUT;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Phase timeout of the `phase_timeout` scenario; its worker hangs three times as long.
const HANG_TIMEOUT: Duration = Duration::from_millis(300);

/// Failure cap per process in the `failure_storm` scenario.
const STORM_CAP: u64 = 25;

/// Operations per second per worker in the `paced` scenario.
const PACED_RATE: f64 = 200.0;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,

    pub seed: u64,

    /// Whether the outcome matched what the scenario expects
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Absent if the cluster could not be built or the run was rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,

    pub elapsed_ms: u64,
}

impl ScenarioResult {
    fn errored(scenario: ScenarioId, seed: u64, reason: String, elapsed: Duration) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            failure_reason: Some(reason),
            outcome: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Runs scenarios, each on a fresh cluster.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    sim: SimConfig,
    duration: Duration,
    phase_timeout: Duration,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            sim: SimConfig {
                seed,
                ..Default::default()
            },
            duration: Duration::from_secs(1),
            phase_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_config(mut self, sim: SimConfig) -> Self {
        self.sim = sim;
        self
    }

    pub fn with_agents(mut self, agents: u32) -> Self {
        self.sim.num_agents = agents;
        self
    }

    pub fn with_workers(mut self, workers_per_agent: u32) -> Self {
        self.sim.workers_per_agent = workers_per_agent;
        self
    }

    pub fn with_link(mut self, link: LinkKind) -> Self {
        self.sim.link = link;
        self
    }

    /// Sets the length of the RUN phase.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    pub fn with_failure_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sim.failure_dir = Some(dir.into());
        self
    }

    pub fn seed(&self) -> u64 {
        self.sim.seed
    }

    /// Runs a scenario and returns the result. Never fails; errors become a
    /// failed result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!(%scenario, seed = self.sim.seed, description = scenario.description(), "starting scenario");
        let started = Instant::now();

        let result = match self.try_run(scenario, started).await {
            Ok(result) => result,
            Err(e) => ScenarioResult::errored(scenario, self.sim.seed, e.to_string(), started.elapsed()),
        };

        match &result.failure_reason {
            None => info!(%scenario, elapsed_ms = result.elapsed_ms, "scenario passed"),
            Some(reason) => error!(%scenario, %reason, "scenario failed"),
        }
        result
    }

    pub async fn run_all(&self, scenarios: &[ScenarioId]) -> Vec<ScenarioResult> {
        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            results.push(self.run(*scenario).await);
        }
        results
    }

    async fn try_run(&self, scenario: ScenarioId, started: Instant) -> Result<ScenarioResult, SimError> {
        let mut sim = self.sim.clone();
        if scenario == ScenarioId::FailureStorm {
            sim.failure_cap = STORM_CAP;
        }

        let world = SimWorld::build(sim).await?;
        let (spec, config) = self.plan(scenario)?;
        let run = world.coordinator().run_test(spec, config).await;
        let verdict = run
            .as_ref()
            .map_err(ToString::to_string)
            .and_then(|outcome| self.verify(scenario, &world, outcome));
        world.shutdown(true).await;

        let outcome = run?;
        Ok(ScenarioResult {
            scenario,
            seed: self.sim.seed,
            passed: verdict.is_ok(),
            failure_reason: verdict.err(),
            outcome: Some(outcome),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn plan(&self, scenario: ScenarioId) -> Result<(TestSpec, RunConfig), SimError> {
        let test_id = format!("{}-{}", scenario.name(), self.sim.seed);
        let last_worker = self.sim.workers_per_agent;
        let poll = (self.duration / 5).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let builder = RunConfig::builder()
            .duration(self.duration)
            .poll_interval(poll)
            .phase_timeout(self.phase_timeout)
            .request_timeout(self.sim.request_timeout);

        let (spec, builder) = match scenario {
            ScenarioId::Baseline => (
                TestSpec::new(test_id, "recording").with_property("threadCount", 2),
                builder.tolerable_failures(vec![]),
            ),
            ScenarioId::CriticalFailure => (
                TestSpec::new(test_id, "failing")
                    .with_property(PROPERTY_FAIL_ITERATION, 3)
                    .with_property(PROPERTY_TARGET_WORKER, last_worker),
                builder.tolerable_failures(vec![]),
            ),
            ScenarioId::ToleratedFailure => (
                TestSpec::new(test_id, "failing")
                    .with_property(PROPERTY_FAIL_PHASE, TestPhase::LocalPrepare)
                    .with_property(PROPERTY_TARGET_WORKER, last_worker),
                builder.tolerable_failures(vec![FailureType::Exception]),
            ),
            ScenarioId::PhaseTimeout => (
                TestSpec::new(test_id, "hanging")
                    .with_property(PROPERTY_HANG_PHASE, TestPhase::LocalPrepare)
                    .with_property(PROPERTY_HANG_MS, (HANG_TIMEOUT * 3).as_millis())
                    .with_property(PROPERTY_TARGET_WORKER, last_worker),
                builder.phase_timeout(HANG_TIMEOUT).tolerable_failures(vec![]),
            ),
            ScenarioId::FailureStorm => (
                TestSpec::new(test_id, "storm").with_property("threadCount", 2),
                builder.tolerable_failures(vec![FailureType::Exception]),
            ),
            ScenarioId::Paced => (
                TestSpec::new(test_id, "latency")
                    .with_property("threadCount", 2)
                    .with_property(PROPERTY_TOTAL_THROUGHPUT, PACED_RATE)
                    .with_property(PROPERTY_MEAN_LATENCY_US, 500),
                builder.tolerable_failures(vec![]),
            ),
        };
        Ok((spec, builder.build()?))
    }

    fn verify(&self, scenario: ScenarioId, world: &SimWorld, outcome: &RunOutcome) -> Result<(), String> {
        let teardown = [TestPhase::LocalTeardown, TestPhase::GlobalTeardown];
        let failures = &outcome.failures;
        let count = |t: FailureType| failures.by_type.get(&t).copied().unwrap_or(0);

        match scenario {
            ScenarioId::Baseline => {
                check(outcome.is_success(), || format!("run did not succeed: {:?}", outcome.abort_reason))?;
                check(outcome.completed_phases == TestPhase::ALL, || {
                    format!("completed {:?}", outcome.completed_phases)
                })?;
                check(outcome.performance.operation_count > 0, || "no operations recorded".into())?;
                for (i, worker) in world.worker_addresses().into_iter().enumerate() {
                    let expected: Vec<TestPhase> = TestPhase::ALL
                        .into_iter()
                        .filter(|p| *p != TestPhase::Run && (i == 0 || !p.is_global()))
                        .collect();
                    let seen = world.phase_log().phases_on(worker);
                    check(seen == expected, || format!("{} saw phases {:?}", worker, seen))?;
                }
                Ok(())
            }
            ScenarioId::CriticalFailure => {
                check(outcome.aborted, || "run was not aborted".into())?;
                check(!outcome.completed_phases.contains(&TestPhase::Run), || "RUN executed".into())?;
                check(outcome.completed_phases.ends_with(&teardown), || {
                    format!("teardown skipped: {:?}", outcome.completed_phases)
                })?;
                check(failures.critical >= 1 && count(FailureType::Exception) >= 1, || {
                    format!("expected a critical exception, got {:?}", failures.by_type)
                })
            }
            ScenarioId::ToleratedFailure => {
                check(outcome.is_success(), || format!("run did not succeed: {:?}", outcome.abort_reason))?;
                check(outcome.completed_phases == TestPhase::ALL, || {
                    format!("completed {:?}", outcome.completed_phases)
                })?;
                check(failures.total >= 1 && failures.critical == 0, || {
                    format!("total={} critical={}", failures.total, failures.critical)
                })
            }
            ScenarioId::PhaseTimeout => {
                check(!outcome.aborted, || format!("run aborted: {:?}", outcome.abort_reason))?;
                check(outcome.timed_out_phases.contains(&TestPhase::LocalPrepare), || {
                    format!("timed out {:?}", outcome.timed_out_phases)
                })?;
                check(!outcome.completed_phases.contains(&TestPhase::Run), || "RUN executed".into())?;
                check(outcome.completed_phases.ends_with(&teardown), || {
                    format!("teardown skipped: {:?}", outcome.completed_phases)
                })?;
                check(count(FailureType::Timeout) >= 1 && failures.critical == 0, || {
                    format!("expected a tolerated timeout, got {:?}", failures.by_type)
                })
            }
            ScenarioId::FailureStorm => {
                let ceiling = STORM_CAP as usize * world.workers().len();
                check(outcome.is_success(), || format!("run did not succeed: {:?}", outcome.abort_reason))?;
                check(failures.total > 0 && failures.total <= ceiling, || {
                    format!("{} failures arrived, cap allows {}", failures.total, ceiling)
                })
            }
            ScenarioId::Paced => {
                check(outcome.is_success(), || format!("run did not succeed: {:?}", outcome.abort_reason))?;
                let expected = PACED_RATE * self.duration.as_secs_f64() * world.workers().len() as f64;
                let actual = outcome.performance.operation_count as f64;
                check(actual >= expected * 0.5 && actual <= expected * 1.5, || {
                    format!("{} operations, expected about {:.0}", actual, expected)
                })
            }
        }
    }
}

fn check(condition: bool, reason: impl FnOnce() -> String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ScenarioRunner {
        ScenarioRunner::new(7).with_duration(Duration::from_millis(300))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_baseline_runs_phases_in_order() {
        let result = runner().with_agents(2).run(ScenarioId::Baseline).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        let outcome = result.outcome.unwrap();
        assert_eq!(outcome.completed_phases, TestPhase::ALL.to_vec());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_critical_failure_tears_down() {
        let result = runner().run(ScenarioId::CriticalFailure).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        let outcome = result.outcome.unwrap();
        assert!(outcome.aborted);
        assert!(!outcome.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tolerated_failure_completes() {
        let result = runner().run(ScenarioId::ToleratedFailure).await;
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_phase_timeout_skips_to_teardown() {
        let result = runner().run(ScenarioId::PhaseTimeout).await;
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_storm_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner().with_failure_dir(dir.path()).run(ScenarioId::FailureStorm).await;
        assert!(result.passed, "{:?}", result.failure_reason);

        let persisted = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(persisted > 0 && persisted <= STORM_CAP as usize * 2, "{} files", persisted);
    }

    #[tokio::test]
    async fn test_bad_cluster_is_a_failed_result() {
        let result = runner().with_workers(0).run(ScenarioId::Baseline).await;
        assert!(!result.passed);
        assert!(result.outcome.is_none());
        assert!(result.failure_reason.unwrap().contains("at least one"));
    }
}
