//! Coordinator process runtime.
//!
//! The coordinator owns the run-wide state: which agents and workers exist,
//! the phase barrier, the performance view and the failure collector of the
//! run in progress. Its handler turns upward notifications into updates of
//! that state; [`Coordinator::run_test`] drives one test through its phases.

use crate::error::{CoreError, TransportError};
use crate::failure::{
    ActiveCollector, CollectorSink, FailureCollector, FailureReporter, FileSink, ReporterConfig,
};
use crate::performance::PerformanceCollector;
use crate::phase::{PhaseBarrier, PhaseOrchestrator, RunConfig, RunOutcome};
use crate::protocol::{MessageEnvelope, Operation, Reply, ReplyStatus, TestSpec};
use crate::router::{OperationHandler, Router};
use async_trait::async_trait;
use stampede_env::{AddressLevel, RuntimeContext, SimulatorAddress};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Known agents and the workers under each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentRegistry {
    agents: BTreeMap<SimulatorAddress, BTreeSet<SimulatorAddress>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_agent(&mut self, agent: SimulatorAddress) -> Result<(), CoreError> {
        if agent.level() != AddressLevel::Agent || agent.is_broadcast() {
            return Err(CoreError::invalid_argument(format!("{} is not an agent address", agent)));
        }
        self.agents.entry(agent).or_default();
        Ok(())
    }

    /// Registers a worker, and its agent if needed.
    pub fn register_worker(&mut self, worker: SimulatorAddress) -> Result<(), CoreError> {
        if worker.level() != AddressLevel::Worker || worker.is_broadcast() {
            return Err(CoreError::invalid_argument(format!("{} is not a worker address", worker)));
        }
        let agent = SimulatorAddress::agent(worker.agent_index());
        self.agents.entry(agent).or_default().insert(worker);
        Ok(())
    }

    pub fn remove_worker(&mut self, worker: &SimulatorAddress) -> bool {
        self.agents
            .values_mut()
            .any(|workers| workers.remove(worker))
    }

    pub fn agents(&self) -> Vec<SimulatorAddress> {
        self.agents.keys().copied().collect()
    }

    /// Every worker, in address order.
    pub fn workers(&self) -> Vec<SimulatorAddress> {
        self.agents.values().flatten().copied().collect()
    }

    pub fn worker_count(&self) -> usize {
        self.agents.values().map(BTreeSet::len).sum()
    }
}

/// Configuration for a [`Coordinator`].
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Directory receiving the coordinator's own failure records, if any
    pub failure_dir: Option<PathBuf>,
    pub reporter: ReporterConfig,
}

impl CoordinatorConfig {
    pub fn with_failure_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.failure_dir = Some(dir.into());
        self
    }
}

/// Request handler and test driver of the coordinator process.
pub struct Coordinator<Ctx: RuntimeContext> {
    router: Arc<Router<Ctx>>,
    registry: RwLock<ComponentRegistry>,
    active: Arc<ActiveCollector>,
    barrier: Arc<PhaseBarrier>,
    performance: Arc<PerformanceCollector>,
    /// Faults observed by the orchestrator
    reporter: Arc<FailureReporter>,
    next_test_index: AtomicU32,
    run_lock: tokio::sync::Mutex<()>,
}

impl<Ctx: RuntimeContext> Coordinator<Ctx> {
    /// Installs the coordinator as the router's handler.
    pub fn new(router: Arc<Router<Ctx>>, config: CoordinatorConfig) -> Result<Arc<Self>, CoreError> {
        let local = router.local();
        let active = Arc::new(ActiveCollector::new());

        // protocol faults at the coordinator count against the running test
        let protocol = Arc::new(FailureReporter::new(local, config.reporter.clone()));
        protocol.add_sink(Arc::new(CollectorSink::new(Arc::clone(&active))));
        router.set_reporter(protocol);

        let reporter = Arc::new(FailureReporter::new(local, config.reporter.clone()));
        if let Some(dir) = &config.failure_dir {
            reporter.add_sink(Arc::new(FileSink::new(dir)?));
        }

        let coordinator = Arc::new(Self {
            router: Arc::clone(&router),
            registry: RwLock::new(ComponentRegistry::new()),
            active,
            barrier: Arc::new(PhaseBarrier::new()),
            performance: Arc::new(PerformanceCollector::new()),
            reporter,
            next_test_index: AtomicU32::new(0),
            run_lock: tokio::sync::Mutex::new(()),
        });
        router.set_handler(Arc::clone(&coordinator) as Arc<dyn OperationHandler>);
        Ok(coordinator)
    }

    pub fn router(&self) -> &Arc<Router<Ctx>> {
        &self.router
    }

    pub fn register_worker(&self, worker: SimulatorAddress) -> Result<(), CoreError> {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_worker(worker)
    }

    pub fn registry(&self) -> ComponentRegistry {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn performance(&self) -> &Arc<PerformanceCollector> {
        &self.performance
    }

    pub fn barrier(&self) -> &Arc<PhaseBarrier> {
        &self.barrier
    }

    /// Runs a test on every registered worker.
    ///
    /// Runs are serialized: a second call waits for the first to finish.
    pub async fn run_test(&self, spec: TestSpec, config: RunConfig) -> Result<RunOutcome, CoreError> {
        let workers = self.registry().workers();
        self.run_test_on(spec, config, &workers).await
    }

    /// Runs a test on the given workers.
    pub async fn run_test_on(
        &self,
        spec: TestSpec,
        config: RunConfig,
        workers: &[SimulatorAddress],
    ) -> Result<RunOutcome, CoreError> {
        if spec.test_id.is_empty() {
            return Err(CoreError::invalid_argument("test id must not be empty"));
        }
        if let Some(bad) = workers.iter().find(|w| w.level() != AddressLevel::Worker || w.is_broadcast()) {
            return Err(CoreError::invalid_argument(format!("{} is not a worker address", bad)));
        }

        let _running = self.run_lock.lock().await;
        let test_index = self.next_test_index.fetch_add(1, Ordering::Relaxed) + 1;
        let targets: Vec<SimulatorAddress> = workers
            .iter()
            .map(|w| SimulatorAddress::test(w.agent_index(), w.worker_index(), test_index))
            .collect();

        let collector = Arc::new(FailureCollector::new(config.tolerable_failures.iter().copied()));
        self.active.set(Arc::clone(&collector));
        let orchestrator = PhaseOrchestrator::new(
            Arc::clone(&self.router),
            Arc::clone(&self.barrier),
            collector,
            Arc::clone(&self.performance),
            Arc::clone(&self.reporter),
            config,
        );

        let outcome = orchestrator.run(&spec, test_index, &targets).await;
        self.active.clear();
        self.performance.clear(&spec.test_id);
        Ok(outcome)
    }

    /// Sends TERMINATE to every agent and waits for their confirmation.
    pub async fn terminate(&self, graceful: bool) -> Vec<(SimulatorAddress, Result<Reply, TransportError>)> {
        let agents = self.registry().agents();
        info!(agents = agents.len(), graceful, "terminating cluster");
        self.request_each(&agents, Operation::Terminate { graceful }).await
    }

    /// Runs a script on every agent the scope reaches (e.g. `A*`).
    pub async fn execute_script(
        &self,
        scope: SimulatorAddress,
        script: &str,
        fire_and_forget: bool,
    ) -> Vec<(SimulatorAddress, Result<Reply, TransportError>)> {
        let agents: Vec<SimulatorAddress> = self
            .registry()
            .agents()
            .into_iter()
            .filter(|agent| scope.reaches(agent) || agent.reaches(&scope))
            .collect();
        let operation = Operation::ExecuteScript {
            script: script.to_string(),
            fire_and_forget,
        };
        self.request_each(&agents, operation).await
    }

    async fn request_each(
        &self,
        destinations: &[SimulatorAddress],
        operation: Operation,
    ) -> Vec<(SimulatorAddress, Result<Reply, TransportError>)> {
        let mut pending = Vec::with_capacity(destinations.len());
        let mut results = Vec::with_capacity(destinations.len());
        for destination in destinations {
            match self.router.send(*destination, operation.clone()).await {
                Ok(promise) => pending.push((*destination, promise)),
                Err(e) => results.push((*destination, Err(e))),
            }
        }
        for (destination, promise) in pending {
            results.push((destination, promise.wait().await));
        }
        results.sort_by_key(|(destination, _)| *destination);
        results
    }

    fn worker_of(source: &SimulatorAddress, op: &str) -> Option<SimulatorAddress> {
        let worker = source.worker_address();
        if worker.is_none() {
            warn!(%source, op, "notification from a non-worker endpoint");
        }
        worker
    }
}

#[async_trait]
impl<Ctx: RuntimeContext> OperationHandler for Coordinator<Ctx> {
    async fn handle(&self, envelope: MessageEnvelope) -> Reply {
        let source = envelope.source;
        match envelope.payload {
            Operation::PhaseCompleted { test_id, phase } => {
                if let Some(worker) = Self::worker_of(&source, "PHASE_COMPLETED") {
                    debug!(%worker, test_id = %test_id, %phase, "phase acknowledged");
                    self.barrier.acknowledge(&test_id, phase, worker);
                }
                Reply::success()
            }
            Operation::PerformanceStats { test_id, sample } => {
                if let Some(worker) = Self::worker_of(&source, "PERFORMANCE_STATS") {
                    self.performance.update(&test_id, worker, sample);
                }
                Reply::success()
            }
            Operation::Failure(record) => {
                let terminal = record.failure_type.is_terminal();
                let origin = record.origin;
                self.active.record(record);
                if terminal {
                    if let Some(worker) = origin.worker_address() {
                        self.barrier.release(worker);
                        self.registry
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove_worker(&worker);
                    }
                }
                Reply::success()
            }
            Operation::Ping => Reply::success(),
            op @ (Operation::CreateTest { .. }
            | Operation::StartPhase { .. }
            | Operation::StopRun { .. }
            | Operation::Terminate { .. }
            | Operation::ExecuteScript { .. }
            | Operation::Reply(_)) => Reply::error(
                ReplyStatus::UnsupportedOperation,
                format!("{} is not handled by the coordinator", op.tag()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, AgentRuntime};
    use crate::error::WorkloadError;
    use crate::failure::{FailureRecord, FailureType};
    use crate::phase::TestPhase;
    use crate::router::RouterConfig;
    use crate::worker::{IterationContext, TestContext, WorkerConfig, WorkerRuntime, Workload, WorkloadRegistry};
    use stampede_env::{ChannelLink, TokioContext};
    use std::time::Duration;

    /// Fails LOCAL_PREPARE on worker 2 when `fail` is set.
    struct Scripted {
        fail: bool,
    }

    impl Workload for Scripted {
        fn on_phase(&self, phase: TestPhase, ctx: &TestContext) -> Result<(), WorkloadError> {
            if self.fail && phase == TestPhase::LocalPrepare && ctx.address().worker_index() == 2 {
                return Err(WorkloadError::failed("prepare failed"));
            }
            Ok(())
        }

        fn run_iteration(&self, _ctx: &mut IterationContext) -> Result<(), WorkloadError> {
            std::thread::sleep(Duration::from_micros(200));
            Ok(())
        }
    }

    fn registry() -> WorkloadRegistry {
        let mut registry = WorkloadRegistry::new();
        registry
            .register("steady", |_| Ok(Arc::new(Scripted { fail: false }) as Arc<dyn Workload>))
            .register("flaky", |_| Ok(Arc::new(Scripted { fail: true }) as Arc<dyn Workload>));
        registry
    }

    /// One agent with `workers` workers, all in-process.
    fn cluster(workers: u32) -> Arc<Coordinator<TokioContext>> {
        cluster_with(workers, CoordinatorConfig::default())
    }

    fn cluster_with(workers: u32, coordinator_config: CoordinatorConfig) -> Arc<Coordinator<TokioContext>> {
        let ctx = Arc::new(TokioContext::seeded(11));
        let config = RouterConfig::default().with_request_timeout(Duration::from_secs(2));
        let root = Router::new(Arc::clone(&ctx), SimulatorAddress::COORDINATOR, config.clone());
        let coordinator = Coordinator::new(Arc::clone(&root), coordinator_config).unwrap();

        let agent = Router::new(Arc::clone(&ctx), SimulatorAddress::agent(1), config.clone());
        root.add_child(ChannelLink::new(agent.local(), agent.inbox_sender()));
        agent.set_parent(ChannelLink::new(root.local(), root.inbox_sender()));
        AgentRuntime::new(Arc::clone(&agent), AgentConfig::default()).unwrap();

        for w in 1..=workers {
            let address = SimulatorAddress::worker(1, w);
            let router = Router::new(Arc::clone(&ctx), address, config.clone());
            agent.add_child(ChannelLink::new(address, router.inbox_sender()));
            router.set_parent(ChannelLink::new(agent.local(), agent.inbox_sender()));
            let worker_config = WorkerConfig::default().with_sample_interval(Duration::from_millis(10));
            WorkerRuntime::new(Arc::clone(&router), registry(), worker_config).unwrap();
            router.start();
            coordinator.register_worker(address).unwrap();
        }
        agent.start();
        root.start();
        coordinator
    }

    fn config(tolerable: Vec<FailureType>) -> RunConfig {
        RunConfig::builder()
            .duration(Duration::from_millis(60))
            .poll_interval(Duration::from_millis(20))
            .phase_timeout(Duration::from_secs(2))
            .request_timeout(Duration::from_secs(1))
            .tolerable_failures(tolerable)
            .build()
            .unwrap()
    }

    #[test]
    fn test_registry_groups_workers_by_agent() {
        let mut registry = ComponentRegistry::new();
        registry.register_worker(SimulatorAddress::worker(2, 1)).unwrap();
        registry.register_worker(SimulatorAddress::worker(1, 2)).unwrap();
        registry.register_worker(SimulatorAddress::worker(1, 1)).unwrap();
        registry.register_agent(SimulatorAddress::agent(3)).unwrap();

        assert_eq!(registry.agents().len(), 3);
        assert_eq!(registry.worker_count(), 3);
        assert_eq!(registry.workers()[0], SimulatorAddress::worker(1, 1));
        assert!(registry.register_worker(SimulatorAddress::agent(1)).is_err());
        assert!(registry.register_worker(SimulatorAddress::all_workers()).is_err());

        assert!(registry.remove_worker(&SimulatorAddress::worker(1, 2)));
        assert!(!registry.remove_worker(&SimulatorAddress::worker(1, 2)));
        assert_eq!(registry.worker_count(), 2);
    }

    #[tokio::test]
    async fn test_successful_run_aggregates_performance() {
        let coordinator = cluster(2);
        let outcome = coordinator
            .run_test(TestSpec::new("steady-1", "steady"), config(vec![]))
            .await
            .unwrap();

        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.completed_phases, TestPhase::ALL.to_vec());
        assert!(outcome.performance.operation_count > 0);
        assert_eq!(outcome.failures.total, 0);
    }

    #[tokio::test]
    async fn test_critical_failure_aborts_and_tears_down() {
        let coordinator = cluster(2);
        let outcome = coordinator
            .run_test(TestSpec::new("flaky-1", "flaky"), config(vec![]))
            .await
            .unwrap();

        assert!(outcome.aborted);
        assert!(!outcome.completed_phases.contains(&TestPhase::Run));
        assert!(outcome.completed_phases.ends_with(&[TestPhase::LocalTeardown, TestPhase::GlobalTeardown]));
        assert_eq!(outcome.failures.critical, 1);
        assert_eq!(outcome.failures.records[0].origin, SimulatorAddress::worker(1, 2));
    }

    #[tokio::test]
    async fn test_tolerated_failure_keeps_running() {
        let coordinator = cluster(2);
        let outcome = coordinator
            .run_test(TestSpec::new("flaky-2", "flaky"), config(vec![FailureType::Exception]))
            .await
            .unwrap();

        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.failures.total, 1);
        assert_eq!(outcome.failures.critical, 0);
    }

    #[tokio::test]
    async fn test_unknown_workload_is_create_error() {
        let coordinator = cluster(1);
        let outcome = coordinator
            .run_test(TestSpec::new("nope", "missing"), config(vec![]))
            .await
            .unwrap();

        assert!(outcome.aborted);
        assert_eq!(outcome.failures.by_type[&FailureType::CreateError], 1);
    }

    #[tokio::test]
    async fn test_runs_past_failure_cap_still_abort() {
        let coordinator = cluster_with(
            1,
            CoordinatorConfig {
                reporter: ReporterConfig::default().with_cap(1),
                ..Default::default()
            },
        );

        for run in 0..3 {
            let outcome = coordinator
                .run_test(TestSpec::new(format!("nope-{}", run), "missing"), config(vec![]))
                .await
                .unwrap();
            assert!(outcome.aborted, "run {} was not aborted", run);
            assert_eq!(outcome.failures.critical, 1);
            assert_eq!(outcome.failures.by_type[&FailureType::CreateError], 1);
        }

        // the cap still allows a clean run afterwards
        let outcome = coordinator
            .run_test(TestSpec::new("steady-after-cap", "steady"), config(vec![]))
            .await
            .unwrap();
        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.failures.total, 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_releases_worker() {
        let coordinator = cluster(2);
        let worker = SimulatorAddress::worker(1, 2);
        coordinator
            .barrier()
            .expect("t", TestPhase::Setup, [SimulatorAddress::worker(1, 1), worker]);

        let record = FailureRecord {
            failure_type: FailureType::AbnormalExit,
            origin: worker,
            test_id: None,
            message: "exit 137".into(),
            cause: "killed".into(),
            sequence: 1,
            timestamp_ms: 0,
            exit_code: Some(137),
        };
        let envelope = MessageEnvelope::fire_and_forget(worker, SimulatorAddress::COORDINATOR, 1, Operation::Failure(record));
        assert!(coordinator.handle(envelope).await.is_success());

        assert_eq!(coordinator.barrier().missing("t", TestPhase::Setup), vec![SimulatorAddress::worker(1, 1)]);
        assert!(coordinator.barrier().is_gone(&worker));
        assert_eq!(coordinator.registry().worker_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_and_scripts_reach_agents() {
        let coordinator = cluster(1);
        let results = coordinator
            .execute_script(SimulatorAddress::all_agents(), "echo ok", false)
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.as_ref().unwrap().payload.as_deref(), Some("ok"));

        let results = coordinator.terminate(true).await;
        assert!(results.iter().all(|(_, r)| r.as_ref().map_or(false, Reply::is_success)));
    }

    #[tokio::test]
    async fn test_rejects_bad_targets() {
        let coordinator = cluster(1);
        let result = coordinator
            .run_test_on(TestSpec::new("t", "steady"), config(vec![]), &[SimulatorAddress::agent(1)])
            .await;
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }
}
