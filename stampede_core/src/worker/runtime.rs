//! Request handler of a worker process.

use super::container::TestContainer;
use super::workload::{TargetDriver, TestContext, WorkloadRegistry};
use crate::error::{CoreError, WorkloadError};
use crate::failure::{FailureCause, FailureReporter, FileSink, ForwardSink, ReporterConfig};
use crate::phase::TestPhase;
use crate::protocol::{MessageEnvelope, Operation, Reply, ReplyStatus, TestSpec};
use crate::router::{OperationHandler, Router, Upstream};
use async_trait::async_trait;
use stampede_env::{mix_seed, RuntimeContext, SimulatorAddress};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Configuration for a [`WorkerRuntime`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often running tests report a performance sample (default: 1s)
    pub sample_interval: Duration,
    /// Directory receiving one file per failure record, if any
    pub failure_dir: Option<PathBuf>,
    pub reporter: ReporterConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            failure_dir: None,
            reporter: ReporterConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_failure_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.failure_dir = Some(dir.into());
        self
    }

    pub fn with_reporter(mut self, reporter: ReporterConfig) -> Self {
        self.reporter = reporter;
        self
    }
}

type Tests = Arc<RwLock<BTreeMap<String, Arc<TestContainer>>>>;

/// Hosts tests on one worker and answers the coordinator's commands.
///
/// Phase callbacks run on blocking threads; the handler replies as soon as
/// a phase has been started and sends PHASE_COMPLETED afterwards, through
/// the same ordered upstream queue as failures and samples.
pub struct WorkerRuntime<Ctx: RuntimeContext> {
    router: Arc<Router<Ctx>>,
    registry: WorkloadRegistry,
    driver: RwLock<Option<Arc<dyn TargetDriver>>>,
    reporter: Arc<FailureReporter>,
    upstream: Upstream,
    tests: Tests,
    config: WorkerConfig,
    terminated: watch::Sender<bool>,
}

impl<Ctx: RuntimeContext> WorkerRuntime<Ctx> {
    /// Installs the runtime as the router's handler and starts the
    /// performance monitor.
    pub fn new(
        router: Arc<Router<Ctx>>,
        registry: WorkloadRegistry,
        config: WorkerConfig,
    ) -> Result<Arc<Self>, CoreError> {
        let local = router.local();
        let upstream = Upstream::spawn(&router, SimulatorAddress::COORDINATOR);

        let reporter = Arc::new(FailureReporter::new(local, config.reporter.clone()));
        reporter.add_sink(Arc::new(ForwardSink::new(upstream.clone())));
        if let Some(dir) = &config.failure_dir {
            reporter.add_sink(Arc::new(FileSink::new(dir)?));
        }
        router.set_reporter(Arc::clone(&reporter));

        let (terminated, _) = watch::channel(false);
        let runtime = Arc::new(Self {
            router: Arc::clone(&router),
            registry,
            driver: RwLock::new(None),
            reporter,
            upstream,
            tests: Arc::new(RwLock::new(BTreeMap::new())),
            config,
            terminated,
        });
        router.set_handler(Arc::clone(&runtime) as Arc<dyn OperationHandler>);
        runtime.spawn_monitor();
        info!(worker = %local, workloads = ?runtime.registry.names(), "worker runtime ready");
        Ok(runtime)
    }

    /// Starts `driver` and hands it to every test created afterwards.
    ///
    /// A driver that fails to start is reported and not installed. A driver
    /// installed earlier is closed once replaced.
    pub fn set_driver(&self, driver: Arc<dyn TargetDriver>) -> Result<(), WorkloadError> {
        if let Err(e) = driver.start_instance() {
            warn!(worker = %self.address(), error = %e, "starting target driver failed");
            self.reporter.report(FailureCause::Workload(e.clone()), None);
            return Err(e);
        }
        info!(worker = %self.address(), "target driver started");

        let previous = self
            .driver
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(driver);
        if let Some(previous) = previous {
            if let Err(e) = previous.close() {
                warn!(worker = %self.address(), error = %e, "closing replaced target driver failed");
            }
        }
        Ok(())
    }

    pub fn address(&self) -> SimulatorAddress {
        self.router.local()
    }

    pub fn reporter(&self) -> &Arc<FailureReporter> {
        &self.reporter
    }

    pub fn test_count(&self) -> usize {
        self.tests.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Becomes true once TERMINATE has been handled.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    fn test(&self, test_id: &str) -> Option<Arc<TestContainer>> {
        self.tests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(test_id)
            .cloned()
    }

    fn not_found(&self, test_id: &str) -> Reply {
        warn!(worker = %self.address(), test_id, "unknown test");
        Reply::error(
            ReplyStatus::TestNotFound,
            format!("test {} not hosted by {}", test_id, self.address()),
        )
    }

    fn create_test(&self, test_index: u32, spec: TestSpec) -> Reply {
        let local = self.address();
        if self.test(&spec.test_id).is_some() {
            return Reply::error(
                ReplyStatus::Exception,
                format!("test {} already exists on {}", spec.test_id, local),
            );
        }

        let workload = match self.registry.create(&spec) {
            Ok(workload) => workload,
            Err(e) => {
                warn!(worker = %local, test_id = %spec.test_id, error = %e, "test creation failed");
                return Reply::error(ReplyStatus::Exception, e.to_string());
            }
        };

        let address = SimulatorAddress::test(local.agent_index(), local.worker_index(), test_index);
        let driver = self
            .driver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let context = TestContext::new(&spec, address, driver, Arc::clone(&self.reporter));
        let stream = (u64::from(local.agent_index()) << 40)
            | (u64::from(local.worker_index()) << 20)
            | u64::from(test_index);
        let seed = mix_seed(self.router.context().seed(), stream);

        match TestContainer::new(context, workload, spec.thread_count(), seed) {
            Ok(container) => {
                info!(worker = %local, test_id = %spec.test_id, %address, workload = %spec.workload, "test created");
                self.tests
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(spec.test_id, Arc::new(container));
                Reply::success()
            }
            Err(e) => {
                warn!(worker = %local, test_id = %spec.test_id, error = %e, "test creation failed");
                Reply::error(ReplyStatus::Exception, e.to_string())
            }
        }
    }

    fn start_phase(&self, test_id: String, phase: TestPhase) -> Reply {
        let Some(container) = self.test(&test_id) else {
            return self.not_found(&test_id);
        };

        if phase == TestPhase::Run {
            // completion of RUN is sent once STOP_RUN joined the threads
            return match container.start_run() {
                Ok(()) => Reply::success(),
                Err(e) => {
                    warn!(test_id = %test_id, error = %e, "workload start failed");
                    Reply::error(ReplyStatus::Exception, e.to_string())
                }
            };
        }

        let reporter = Arc::clone(&self.reporter);
        let upstream = self.upstream.clone();
        self.router.context().spawn("test-phase", async move {
            let result = tokio::task::spawn_blocking(move || container.run_phase(phase)).await;
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(cause)) => Some(cause),
                Err(e) => Some(FailureCause::Panic(e.to_string())),
            };
            match failure {
                Some(cause) => {
                    warn!(test_id = %test_id, %phase, "phase failed");
                    reporter.report(cause, Some(&test_id));
                }
                None => debug!(test_id = %test_id, %phase, "phase finished"),
            }
            if let Err(e) = upstream.send(Operation::PhaseCompleted { test_id, phase }) {
                warn!(%phase, error = %e, "phase completion not sent");
            }
        });
        Reply::success()
    }

    fn stop_run(&self, test_id: String) -> Reply {
        let Some(container) = self.test(&test_id) else {
            return self.not_found(&test_id);
        };

        let upstream = self.upstream.clone();
        self.router.context().spawn("test-stop", async move {
            let stopped = tokio::task::spawn_blocking(move || {
                container.stop_run();
                container.sample()
            })
            .await;
            match stopped {
                Ok(sample) => {
                    let stats = Operation::PerformanceStats {
                        test_id: test_id.clone(),
                        sample,
                    };
                    if let Err(e) = upstream.send(stats) {
                        warn!(test_id = %test_id, error = %e, "final sample not sent");
                    }
                }
                Err(e) => warn!(test_id = %test_id, error = %e, "stopping workload failed"),
            }
            let completed = Operation::PhaseCompleted {
                test_id,
                phase: TestPhase::Run,
            };
            if let Err(e) = upstream.send(completed) {
                warn!(error = %e, "run completion not sent");
            }
        });
        Reply::success()
    }

    async fn terminate(&self, graceful: bool) -> Reply {
        info!(worker = %self.address(), graceful, "terminating");
        if graceful {
            let tests: Vec<Arc<TestContainer>> = self
                .tests
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect();
            for container in tests {
                if let Err(e) = tokio::task::spawn_blocking(move || container.stop_run()).await {
                    warn!(error = %e, "stopping test during terminate failed");
                }
            }
        }

        let driver = self
            .driver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(driver) = driver {
            if let Err(e) = driver.close() {
                warn!(worker = %self.address(), error = %e, "closing target driver failed");
            }
        }
        self.terminated.send_replace(true);
        Reply::success()
    }

    /// Periodically sends a sample for every running test.
    fn spawn_monitor(&self) {
        let tests = Arc::clone(&self.tests);
        let upstream = self.upstream.clone();
        let ctx = Arc::clone(self.router.context());
        let interval = self.config.sample_interval;
        let mut terminated = self.terminated.subscribe();

        self.router.context().spawn("performance-monitor", async move {
            loop {
                tokio::select! {
                    _ = ctx.sleep(interval) => {}
                    _ = terminated.changed() => return,
                }
                let running: Vec<Arc<TestContainer>> = tests
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|c| c.is_running())
                    .cloned()
                    .collect();
                for container in running {
                    let stats = Operation::PerformanceStats {
                        test_id: container.test_id().to_string(),
                        sample: container.sample(),
                    };
                    if upstream.send(stats).is_err() {
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl<Ctx: RuntimeContext> OperationHandler for WorkerRuntime<Ctx> {
    async fn handle(&self, envelope: MessageEnvelope) -> Reply {
        match envelope.payload {
            Operation::CreateTest { test_index, spec } => self.create_test(test_index, spec),
            Operation::StartPhase { test_id, phase } => self.start_phase(test_id, phase),
            Operation::StopRun { test_id } => self.stop_run(test_id),
            Operation::Terminate { graceful } => self.terminate(graceful).await,
            Operation::Ping => Reply::success(),
            op @ (Operation::ExecuteScript { .. }
            | Operation::PhaseCompleted { .. }
            | Operation::PerformanceStats { .. }
            | Operation::Failure(_)
            | Operation::Reply(_)) => Reply::error(
                ReplyStatus::UnsupportedOperation,
                format!("{} is not handled by worker {}", op.tag(), self.address()),
            ),
        }
    }
}
