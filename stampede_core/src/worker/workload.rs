//! Workload plug-in contract.

use crate::error::WorkloadError;
use crate::failure::{FailureCause, FailureReporter};
use crate::performance::Probe;
use crate::phase::TestPhase;
use crate::protocol::TestSpec;
use rand_chacha::ChaCha8Rng;
use stampede_env::SimulatorAddress;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// User code exercised by a test.
///
/// `on_phase` runs once per lifecycle phase on a blocking thread (GLOBAL
/// phases only on the designated worker). During RUN, `run_iteration` is
/// called in a loop on each of the test's iteration threads until the test
/// is stopped or an iteration fails.
pub trait Workload: Send + Sync {
    fn on_phase(&self, phase: TestPhase, ctx: &TestContext) -> Result<(), WorkloadError> {
        let _ = (phase, ctx);
        Ok(())
    }

    fn run_iteration(&self, ctx: &mut IterationContext) -> Result<(), WorkloadError>;
}

/// Handle to the system under test.
pub trait TargetDriver: Send + Sync {
    /// Connects to (or starts) the target instance.
    fn start_instance(&self) -> Result<(), WorkloadError>;

    /// Client handle for workloads; downcast to the driver's concrete type.
    fn instance(&self) -> Result<Arc<dyn Any + Send + Sync>, WorkloadError>;

    fn close(&self) -> Result<(), WorkloadError>;
}

/// Per-test state shared by the phase callbacks and every iteration thread.
pub struct TestContext {
    test_id: String,
    test_index: u32,
    address: SimulatorAddress,
    properties: BTreeMap<String, String>,
    driver: Option<Arc<dyn TargetDriver>>,
    reporter: Arc<FailureReporter>,
    stopped: Arc<AtomicBool>,
}

impl TestContext {
    pub fn new(
        spec: &TestSpec,
        address: SimulatorAddress,
        driver: Option<Arc<dyn TargetDriver>>,
        reporter: Arc<FailureReporter>,
    ) -> Self {
        Self {
            test_id: spec.test_id.clone(),
            test_index: address.test_index(),
            address,
            properties: spec.properties.clone(),
            driver,
            reporter,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn test_index(&self) -> u32 {
        self.test_index
    }

    /// Test-level address of this test instance.
    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parses a property, returning `None` when absent or unparseable.
    pub fn parse_property<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.property(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn driver(&self) -> Option<&Arc<dyn TargetDriver>> {
        self.driver.as_ref()
    }

    /// True once the RUN phase has been asked to stop.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stop_flag(&self) -> &Arc<AtomicBool> {
        &self.stopped
    }

    /// Reports a fault without stopping anything.
    pub fn report_failure(&self, cause: impl Into<FailureCause>) {
        self.reporter.report(cause.into(), Some(&self.test_id));
    }

    pub(crate) fn reporter(&self) -> &Arc<FailureReporter> {
        &self.reporter
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("test_id", &self.test_id)
            .field("address", &self.address)
            .field("has_driver", &self.driver.is_some())
            .finish()
    }
}

/// State owned by one iteration thread.
pub struct IterationContext {
    test: Arc<TestContext>,
    thread_index: usize,
    iteration: u64,
    rng: ChaCha8Rng,
    probe: Arc<Probe>,
}

impl IterationContext {
    pub(crate) fn new(test: Arc<TestContext>, thread_index: usize, rng: ChaCha8Rng, probe: Arc<Probe>) -> Self {
        Self {
            test,
            thread_index,
            iteration: 0,
            rng,
            probe,
        }
    }

    pub fn test(&self) -> &TestContext {
        &self.test
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    /// Zero-based count of iterations this thread completed.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Deterministic per-thread random stream.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Latency probe of the test; iterations are timed automatically.
    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    pub fn is_stopped(&self) -> bool {
        self.test.is_stopped()
    }

    /// Reports a fault and keeps iterating.
    pub fn report_failure(&self, cause: impl Into<FailureCause>) {
        self.test.report_failure(cause);
    }

    pub(crate) fn advance(&mut self) {
        self.iteration += 1;
    }
}

/// Builds a workload for a test spec.
pub type WorkloadFactory =
    Arc<dyn Fn(&TestSpec) -> Result<Arc<dyn Workload>, WorkloadError> + Send + Sync>;

/// Workloads a worker can host, by name.
#[derive(Clone, Default)]
pub struct WorkloadRegistry {
    factories: HashMap<String, WorkloadFactory>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&TestSpec) -> Result<Arc<dyn Workload>, WorkloadError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Instantiates the workload named by `spec.workload`.
    pub fn create(&self, spec: &TestSpec) -> Result<Arc<dyn Workload>, WorkloadError> {
        let factory = self
            .factories
            .get(&spec.workload)
            .ok_or_else(|| WorkloadError::UnknownWorkload(spec.workload.clone()))?;
        factory(spec)
    }
}

impl fmt::Debug for WorkloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadRegistry")
            .field("workloads", &self.names())
            .finish()
    }
}
