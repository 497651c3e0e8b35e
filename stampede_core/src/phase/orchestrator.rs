//! Coordinator-side driver of one test run.

use super::barrier::{BarrierOutcome, PhaseBarrier};
use super::config::RunConfig;
use super::test_phase::TestPhase;
use crate::error::TransportError;
use crate::failure::{FailureCause, FailureCollector, FailureReporter, FailureSummary};
use crate::performance::{PerformanceCollector, PerformanceSample};
use crate::protocol::{Operation, TestSpec};
use crate::router::Router;
use serde::{Deserialize, Serialize};
use stampede_env::{RuntimeContext, SimulatorAddress};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Final report of a test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub test_id: String,
    /// Phases whose barrier completed, in execution order
    pub completed_phases: Vec<TestPhase>,
    /// Phases not executed (disabled verification, or skipped after an abort)
    pub skipped_phases: Vec<TestPhase>,
    /// A critical failure stopped the run
    pub aborted: bool,
    pub abort_reason: Option<String>,
    /// Phases whose barrier passed its deadline
    pub timed_out_phases: Vec<TestPhase>,
    pub failures: FailureSummary,
    /// Aggregate of the last sample of every worker
    pub performance: PerformanceSample,
    pub elapsed_ms: u64,
}

impl RunOutcome {
    /// True if every phase completed without critical failure or timeout.
    pub fn is_success(&self) -> bool {
        !self.aborted && self.timed_out_phases.is_empty() && self.failures.critical == 0
    }
}

#[derive(Default)]
struct RunState {
    completed: Vec<TestPhase>,
    skipped: Vec<TestPhase>,
    timed_out: Vec<TestPhase>,
    aborted: bool,
    abort_reason: Option<String>,
}

impl RunState {
    fn abort(&mut self, reason: String) {
        if !self.aborted {
            error!(reason = %reason, "aborting run, continuing with teardown");
            self.aborted = true;
            self.abort_reason = Some(reason);
        }
    }

    /// Only teardown remains once the run was aborted or a phase timed out.
    fn teardown_only(&self) -> bool {
        self.aborted || !self.timed_out.is_empty()
    }
}

/// Drives a test through its phases across the workers hosting it.
///
/// Phases run strictly in order. Before phase N+1 starts, every
/// participating worker has acknowledged phase N, or the barrier timed out,
/// or a critical failure aborted the run. Teardown phases run in every
/// case so workloads can release what they acquired.
///
/// The orchestrator records its own failures straight into the run's
/// collector, past the reporter's cap too: the cap limits what its sinks
/// see, never what the run classifies. Failures from workers and agents
/// reach the same collector through the coordinator's handler.
pub struct PhaseOrchestrator<Ctx: RuntimeContext> {
    ctx: Arc<Ctx>,
    router: Arc<Router<Ctx>>,
    barrier: Arc<PhaseBarrier>,
    collector: Arc<FailureCollector>,
    performance: Arc<PerformanceCollector>,
    reporter: Arc<FailureReporter>,
    config: RunConfig,
}

impl<Ctx: RuntimeContext> PhaseOrchestrator<Ctx> {
    pub fn new(
        router: Arc<Router<Ctx>>,
        barrier: Arc<PhaseBarrier>,
        collector: Arc<FailureCollector>,
        performance: Arc<PerformanceCollector>,
        reporter: Arc<FailureReporter>,
        config: RunConfig,
    ) -> Self {
        Self {
            ctx: Arc::clone(router.context()),
            router,
            barrier,
            collector,
            performance,
            reporter,
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs the test on the given test-level targets and reports the outcome.
    ///
    /// Never fails: every problem ends up as a failure record or a timed out
    /// phase in the returned [`RunOutcome`].
    pub async fn run(&self, spec: &TestSpec, test_index: u32, targets: &[SimulatorAddress]) -> RunOutcome {
        let started = self.ctx.now();
        let test_id = spec.test_id.as_str();
        let mut state = RunState::default();

        let mut targets = targets.to_vec();
        targets.sort();
        targets.dedup();
        info!(
            test_id,
            workload = %spec.workload,
            targets = targets.len(),
            duration_secs = self.config.duration.as_secs_f64(),
            "starting test"
        );

        let mut live = self.create(spec, test_index, &targets).await;
        if live.is_empty() && !targets.is_empty() {
            state.abort(format!("no worker could create test {}", test_id));
        } else if let Some(record) = self.collector.first_critical(test_id) {
            state.abort(format!("critical failure while creating test: {}", record));
        }

        for phase in TestPhase::ALL {
            if state.teardown_only() && !phase.is_teardown() {
                state.skipped.push(phase);
                continue;
            }
            if phase.is_verify() && !self.config.verify_enabled {
                info!(test_id, %phase, "verification disabled, skipping phase");
                state.skipped.push(phase);
                continue;
            }

            live.retain(|target| !self.barrier.is_gone(&worker_of(target)));
            let abortable = !state.teardown_only();
            let outcome = if phase == TestPhase::Run {
                self.run_phase(test_id, &live).await
            } else {
                self.execute(test_id, phase, &live, abortable).await
            };

            match outcome {
                BarrierOutcome::Completed => {
                    info!(test_id, %phase, "phase completed");
                    state.completed.push(phase);
                    if abortable {
                        if let Some(record) = self.collector.first_critical(test_id) {
                            state.abort(format!("critical failure during {}: {}", phase, record));
                        }
                    }
                }
                BarrierOutcome::TimedOut { missing } => {
                    let waiting: Vec<String> = missing.iter().map(|w| w.to_string()).collect();
                    warn!(test_id, %phase, missing = ?waiting, "phase timed out");
                    state.timed_out.push(phase);
                    let cause = FailureCause::Timeout {
                        what: format!("{} of {} waiting for [{}]", phase, test_id, waiting.join(", ")),
                        after: self.config.phase_timeout,
                    };
                    self.record_as(cause, test_id, self.config.phase_timeout_is_critical);
                    if self.config.phase_timeout_is_critical {
                        state.abort(format!("{} timed out", phase));
                    }
                }
                BarrierOutcome::Aborted => {
                    let reason = self
                        .collector
                        .first_critical(test_id)
                        .map(|record| format!("critical failure during {}: {}", phase, record))
                        .unwrap_or_else(|| format!("{} aborted", phase));
                    state.abort(reason);
                }
            }
        }

        let elapsed = self.ctx.now().saturating_sub(started);
        let outcome = RunOutcome {
            test_id: test_id.to_string(),
            completed_phases: state.completed,
            skipped_phases: state.skipped,
            aborted: state.aborted,
            abort_reason: state.abort_reason,
            timed_out_phases: state.timed_out,
            failures: self.collector.summary(),
            performance: self.performance.aggregate(test_id),
            elapsed_ms: elapsed.as_millis() as u64,
        };
        info!(
            test_id,
            success = outcome.is_success(),
            aborted = outcome.aborted,
            failures = outcome.failures.total,
            critical = outcome.failures.critical,
            operations = outcome.performance.operation_count,
            elapsed_ms = outcome.elapsed_ms,
            "test finished"
        );
        outcome
    }

    /// Creates the test on every target; returns those that accepted it.
    async fn create(&self, spec: &TestSpec, test_index: u32, targets: &[SimulatorAddress]) -> Vec<SimulatorAddress> {
        let operation = Operation::CreateTest {
            test_index,
            spec: spec.clone(),
        };
        let accepted = self.request_all(&spec.test_id, None, targets, operation).await;
        info!(test_id = %spec.test_id, created = accepted.len(), requested = targets.len(), "test created");
        accepted
    }

    /// Runs one non-RUN phase to completion of its barrier.
    async fn execute(
        &self,
        test_id: &str,
        phase: TestPhase,
        live: &[SimulatorAddress],
        abortable: bool,
    ) -> BarrierOutcome {
        let participants: Vec<SimulatorAddress> = if phase.is_global() {
            live.first().copied().into_iter().collect()
        } else {
            live.to_vec()
        };
        if participants.is_empty() {
            return BarrierOutcome::Completed;
        }

        info!(test_id, %phase, workers = participants.len(), "starting phase");
        let deadline = tokio::time::Instant::now() + self.config.phase_timeout;
        self.barrier
            .expect(test_id, phase, participants.iter().map(worker_of));
        let operation = Operation::StartPhase {
            test_id: test_id.to_string(),
            phase,
        };
        self.request_all(test_id, Some(phase), &participants, operation).await;

        let outcome = self.wait(test_id, phase, deadline, abortable).await;
        self.barrier.clear(test_id, phase);
        outcome
    }

    /// Starts the workload, lets it run for the configured duration, then
    /// stops it and collects the final acknowledgements.
    async fn run_phase(&self, test_id: &str, live: &[SimulatorAddress]) -> BarrierOutcome {
        if live.is_empty() {
            return BarrierOutcome::Completed;
        }

        let phase = TestPhase::Run;
        info!(test_id, workers = live.len(), "starting workload");
        self.barrier
            .expect(test_id, phase, live.iter().map(worker_of));
        let start = Operation::StartPhase {
            test_id: test_id.to_string(),
            phase,
        };
        let running = self.request_all(test_id, Some(phase), live, start).await;

        let aborted = self.await_duration(test_id).await;

        info!(test_id, aborted, "stopping workload");
        let stop = Operation::StopRun {
            test_id: test_id.to_string(),
        };
        self.request_all(test_id, Some(phase), &running, stop).await;

        // stop acknowledgements are collected even after an abort
        let deadline = tokio::time::Instant::now() + self.config.phase_timeout;
        let outcome = self.wait(test_id, phase, deadline, false).await;
        self.barrier.clear(test_id, phase);

        match outcome {
            BarrierOutcome::Completed if aborted => BarrierOutcome::Aborted,
            other => other,
        }
    }

    /// Sleeps through the run duration in poll-interval slices. Returns true
    /// if a critical failure cut it short.
    async fn await_duration(&self, test_id: &str) -> bool {
        let duration = self.config.duration;
        let started = self.ctx.now();
        let mut abort = self.collector.subscribe();

        loop {
            if self.collector.has_critical(test_id) {
                warn!(test_id, "critical failure during run");
                return true;
            }
            let elapsed = self.ctx.now().saturating_sub(started);
            if elapsed >= duration {
                return false;
            }

            let slice = self.config.poll_interval.min(duration - elapsed);
            tokio::select! {
                _ = self.ctx.sleep(slice) => {
                    let elapsed = self.ctx.now().saturating_sub(started).min(duration);
                    let sample = self.performance.aggregate(test_id);
                    info!(
                        test_id,
                        elapsed_secs = elapsed.as_secs(),
                        percent = 100.0 * elapsed.as_secs_f64() / duration.as_secs_f64(),
                        operations = sample.operation_count,
                        throughput = sample.interval_throughput,
                        "run in progress"
                    );
                }
                changed = abort.changed() => {
                    // the sender lives in the collector, which outlives this loop
                    if changed.is_err() {
                        return self.collector.has_critical(test_id);
                    }
                }
            }
        }
    }

    async fn wait(
        &self,
        test_id: &str,
        phase: TestPhase,
        deadline: tokio::time::Instant,
        abortable: bool,
    ) -> BarrierOutcome {
        let mut abort = self.collector.subscribe();
        let collector = Arc::clone(&self.collector);
        self.barrier
            .wait(test_id, phase, deadline, &mut abort, || {
                abortable && collector.has_critical(test_id)
            })
            .await
    }

    /// Sends the operation to every target concurrently and waits for all
    /// replies. Returns the targets that answered with success.
    ///
    /// A target that fails is reported and, when a phase is given, withdrawn
    /// from that phase's barrier.
    async fn request_all(
        &self,
        test_id: &str,
        phase: Option<TestPhase>,
        targets: &[SimulatorAddress],
        operation: Operation,
    ) -> Vec<SimulatorAddress> {
        let tag = operation.tag();
        let timeout = self.config.request_timeout;

        let mut promises = Vec::with_capacity(targets.len());
        for target in targets {
            match self
                .router
                .send_with_timeout(*target, operation.clone(), timeout)
                .await
            {
                Ok(promise) => promises.push((*target, promise)),
                Err(e) => self.request_failed(test_id, phase, tag, *target, e),
            }
        }

        let mut accepted = Vec::with_capacity(promises.len());
        for (target, promise) in promises {
            match promise.wait().await.and_then(|reply| reply.into_result()) {
                Ok(_) => accepted.push(target),
                Err(e) => self.request_failed(test_id, phase, tag, target, e),
            }
        }
        accepted
    }

    fn request_failed(
        &self,
        test_id: &str,
        phase: Option<TestPhase>,
        tag: &str,
        target: SimulatorAddress,
        error: TransportError,
    ) {
        warn!(test_id, op = tag, %target, error = %error, "request failed");
        let cause = match (&error, phase) {
            (TransportError::Timeout { after, .. }, _) => FailureCause::Timeout {
                what: format!("{} request to {}", tag, target),
                after: *after,
            },
            (_, None) => FailureCause::CreateFailed(format!("{}: {}", target, error)),
            (_, Some(_)) => FailureCause::Protocol(format!("{} to {} failed: {}", tag, target, error)),
        };
        let (record, _) = self.reporter.capture_for(target, cause, Some(test_id));
        self.collector.record(record);
        if let Some(phase) = phase {
            self.barrier.withdraw(test_id, phase, worker_of(&target));
        }
    }

    fn record_as(&self, cause: FailureCause, test_id: &str, critical: bool) {
        let (record, _) = self.reporter.capture(cause, Some(test_id));
        self.collector.record_as(record, critical);
    }
}

/// Worker hosting a test-level target.
fn worker_of(target: &SimulatorAddress) -> SimulatorAddress {
    target.worker_address().unwrap_or(*target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{FailureType, ReporterConfig};
    use crate::protocol::{MessageEnvelope, Reply};
    use crate::router::{OperationHandler, RouterConfig};
    use async_trait::async_trait;
    use stampede_env::{ChannelLink, TokioContext};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Worker double: accepts everything and acknowledges phases through
    /// the coordinator's barrier directly.
    struct FakeWorker {
        address: SimulatorAddress,
        barrier: Arc<PhaseBarrier>,
        seen: Arc<Mutex<Vec<(SimulatorAddress, String)>>>,
        silent_in: Option<TestPhase>,
        reject_create: bool,
    }

    #[async_trait]
    impl OperationHandler for FakeWorker {
        async fn handle(&self, envelope: MessageEnvelope) -> Reply {
            let op = envelope.payload;
            self.seen
                .lock()
                .unwrap()
                .push((self.address, op.tag().to_string()));
            match op {
                Operation::CreateTest { .. } if self.reject_create => {
                    Reply::error(crate::protocol::ReplyStatus::Exception, "no such workload")
                }
                Operation::StartPhase { test_id, phase } if phase != TestPhase::Run => {
                    if self.silent_in != Some(phase) {
                        self.barrier.acknowledge(&test_id, phase, self.address);
                    }
                    Reply::success()
                }
                Operation::StopRun { test_id } => {
                    self.barrier.acknowledge(&test_id, TestPhase::Run, self.address);
                    Reply::success()
                }
                _ => Reply::success(),
            }
        }
    }

    struct Fixture {
        orchestrator: PhaseOrchestrator<TokioContext>,
        seen: Arc<Mutex<Vec<(SimulatorAddress, String)>>>,
        collector: Arc<FailureCollector>,
    }

    fn fixture(workers: u32, config: RunConfig, silent_in: Option<TestPhase>, reject: Option<u32>) -> Fixture {
        let reporter = FailureReporter::shared(SimulatorAddress::COORDINATOR);
        fixture_with_reporter(workers, config, silent_in, reject, reporter)
    }

    fn fixture_with_reporter(
        workers: u32,
        config: RunConfig,
        silent_in: Option<TestPhase>,
        reject: Option<u32>,
        reporter: Arc<FailureReporter>,
    ) -> Fixture {
        let ctx = Arc::new(TokioContext::seeded(7));
        let coordinator = Router::new(Arc::clone(&ctx), SimulatorAddress::COORDINATOR, RouterConfig::default());
        let barrier = Arc::new(PhaseBarrier::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for w in 1..=workers {
            let address = SimulatorAddress::worker(1, w);
            let worker = Router::new(Arc::clone(&ctx), address, RouterConfig::default());
            worker.set_handler(Arc::new(FakeWorker {
                address,
                barrier: Arc::clone(&barrier),
                seen: Arc::clone(&seen),
                silent_in,
                reject_create: reject == Some(w),
            }));
            coordinator.add_child(ChannelLink::new(address, worker.inbox_sender()));
            worker.set_parent(ChannelLink::new(SimulatorAddress::COORDINATOR, coordinator.inbox_sender()));
            worker.start();
        }
        coordinator.start();

        let collector = Arc::new(FailureCollector::new(config.tolerable_failures.clone()));
        let orchestrator = PhaseOrchestrator::new(
            coordinator,
            barrier,
            Arc::clone(&collector),
            Arc::new(PerformanceCollector::new()),
            reporter,
            config,
        );
        Fixture {
            orchestrator,
            seen,
            collector,
        }
    }

    fn config() -> crate::phase::RunConfigBuilder {
        RunConfig::builder()
            .duration(Duration::from_millis(50))
            .poll_interval(Duration::from_millis(10))
            .phase_timeout(Duration::from_millis(500))
            .request_timeout(Duration::from_millis(500))
            .tolerable_failures(Vec::<FailureType>::new())
    }

    fn targets(workers: u32) -> Vec<SimulatorAddress> {
        (1..=workers).map(|w| SimulatorAddress::test(1, w, 1)).collect()
    }

    #[tokio::test]
    async fn test_runs_every_phase_in_order() {
        let f = fixture(2, config().build().unwrap(), None, None);
        let outcome = f
            .orchestrator
            .run(&TestSpec::new("t1", "noop"), 1, &targets(2))
            .await;

        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.completed_phases, TestPhase::ALL.to_vec());
        assert!(outcome.skipped_phases.is_empty());

        // global phases only reach the first worker
        let seen = f.seen.lock().unwrap().clone();
        let second: Vec<&String> = seen
            .iter()
            .filter(|(w, _)| *w == SimulatorAddress::worker(1, 2))
            .map(|(_, op)| op)
            .collect();
        let starts = second.iter().filter(|op| op.as_str() == "START_PHASE").count();
        assert_eq!(starts, 6);
        assert!(second.contains(&&"STOP_RUN".to_string()));
    }

    #[tokio::test]
    async fn test_verify_phases_can_be_disabled() {
        let f = fixture(1, config().verify_enabled(false).build().unwrap(), None, None);
        let outcome = f
            .orchestrator
            .run(&TestSpec::new("t1", "noop"), 1, &targets(1))
            .await;

        assert!(outcome.is_success());
        assert_eq!(
            outcome.skipped_phases,
            vec![TestPhase::LocalVerify, TestPhase::GlobalVerify]
        );
    }

    #[tokio::test]
    async fn test_phase_timeout_skips_to_teardown() {
        let config = config()
            .phase_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let f = fixture(1, config, Some(TestPhase::LocalPrepare), None);
        let outcome = f
            .orchestrator
            .run(&TestSpec::new("t1", "noop"), 1, &targets(1))
            .await;

        assert!(!outcome.is_success());
        assert!(!outcome.aborted);
        assert_eq!(outcome.timed_out_phases, vec![TestPhase::LocalPrepare]);
        assert_eq!(
            outcome.completed_phases,
            vec![TestPhase::Setup, TestPhase::LocalTeardown, TestPhase::GlobalTeardown]
        );
        assert_eq!(outcome.failures.by_type[&FailureType::Timeout], 1);
        assert_eq!(outcome.failures.critical, 0);
    }

    #[tokio::test]
    async fn test_create_failure_is_critical_and_aborts() {
        let f = fixture(2, config().build().unwrap(), None, Some(2));
        let outcome = f
            .orchestrator
            .run(&TestSpec::new("t1", "noop"), 1, &targets(2))
            .await;

        assert!(outcome.aborted);
        assert_eq!(outcome.failures.by_type[&FailureType::CreateError], 1);
        assert_eq!(
            outcome.completed_phases,
            vec![TestPhase::LocalTeardown, TestPhase::GlobalTeardown]
        );
        assert!(f.collector.has_critical("t1"));
    }

    #[tokio::test]
    async fn test_capped_reporter_still_classifies() {
        let reporter = Arc::new(FailureReporter::new(
            SimulatorAddress::COORDINATOR,
            ReporterConfig::default().with_cap(0),
        ));
        let f = fixture_with_reporter(2, config().build().unwrap(), None, Some(2), Arc::clone(&reporter));
        let outcome = f
            .orchestrator
            .run(&TestSpec::new("t1", "noop"), 1, &targets(2))
            .await;

        assert!(outcome.aborted);
        assert!(!outcome.is_success());
        assert_eq!(outcome.failures.critical, 1);
        assert_eq!(outcome.failures.by_type[&FailureType::CreateError], 1);
        assert!(!outcome.completed_phases.contains(&TestPhase::Run));
        // nothing was emitted, but the fault was counted
        assert!(reporter.drain().is_empty());
        assert_eq!(reporter.total_count(), 1);
    }

    #[tokio::test]
    async fn test_capped_timeout_still_recorded() {
        let reporter = Arc::new(FailureReporter::new(
            SimulatorAddress::COORDINATOR,
            ReporterConfig::default().with_cap(0),
        ));
        let config = config()
            .phase_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let f = fixture_with_reporter(1, config, Some(TestPhase::LocalPrepare), None, reporter);
        let outcome = f
            .orchestrator
            .run(&TestSpec::new("t1", "noop"), 1, &targets(1))
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.failures.by_type[&FailureType::Timeout], 1);
    }

    #[tokio::test]
    async fn test_tolerated_create_failure_continues_with_survivors() {
        let config = config()
            .tolerable_failures([FailureType::CreateError])
            .build()
            .unwrap();
        let f = fixture(2, config, None, Some(1));
        let outcome = f
            .orchestrator
            .run(&TestSpec::new("t1", "noop"), 1, &targets(2))
            .await;

        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.completed_phases.len(), TestPhase::ALL.len());

        // the rejecting worker never saw a phase
        let seen = f.seen.lock().unwrap().clone();
        assert!(!seen
            .iter()
            .any(|(w, op)| *w == SimulatorAddress::worker(1, 1) && op == "START_PHASE"));
    }

    #[tokio::test]
    async fn test_no_targets_completes_immediately() {
        let f = fixture(0, config().build().unwrap(), None, None);
        let outcome = f.orchestrator.run(&TestSpec::new("t1", "noop"), 1, &[]).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.completed_phases.len(), TestPhase::ALL.len());
    }
}
