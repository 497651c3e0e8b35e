//! Built-in workloads used by the scenarios.
//!
//! | name        | behaviour                                                      |
//! |-------------|----------------------------------------------------------------|
//! | `noop`      | iterations return immediately                                  |
//! | `latency`   | iterations sleep for an exponentially distributed time         |
//! | `failing`   | fails a chosen phase, or a chosen iteration during RUN         |
//! | `hanging`   | blocks a chosen phase for `hangMs`                             |
//! | `recording` | appends every phase callback to a shared [`PhaseLog`]          |
//! | `storm`     | reports a failure on every iteration without stopping          |

use rand_distr::{Distribution, Exp};
use stampede_core::phase::TestPhase;
use stampede_core::protocol::TestSpec;
use stampede_core::worker::{IterationContext, TestContext, Workload, WorkloadRegistry};
use stampede_core::WorkloadError;
use stampede_env::SimulatorAddress;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Phase at which `failing` or `hanging` misbehave.
pub const PROPERTY_FAIL_PHASE: &str = "failPhase";
/// Iteration (per thread, zero-based) at which `failing` fails during RUN.
pub const PROPERTY_FAIL_ITERATION: &str = "failIteration";
/// Phase that `hanging` blocks.
pub const PROPERTY_HANG_PHASE: &str = "hangPhase";
/// How long `hanging` blocks, in milliseconds (default 1000).
pub const PROPERTY_HANG_MS: &str = "hangMs";
/// Restricts `failing` and `hanging` to one worker index.
pub const PROPERTY_TARGET_WORKER: &str = "targetWorker";
/// Mean iteration latency of `latency`, in microseconds (default 200).
pub const PROPERTY_MEAN_LATENCY_US: &str = "meanLatencyUs";
/// Pause between `storm` failures, in microseconds (default 100).
pub const PROPERTY_STORM_PAUSE_US: &str = "stormPauseUs";

/// Phase callbacks seen by `recording` workloads, across all workers.
#[derive(Debug, Clone, Default)]
pub struct PhaseLog {
    events: Arc<Mutex<Vec<(SimulatorAddress, TestPhase)>>>,
}

impl PhaseLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, worker: SimulatorAddress, phase: TestPhase) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((worker, phase));
    }

    pub fn events(&self) -> Vec<(SimulatorAddress, TestPhase)> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Phases recorded on one worker, in callback order.
    pub fn phases_on(&self, worker: SimulatorAddress) -> Vec<TestPhase> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(w, _)| *w == worker)
            .map(|(_, p)| *p)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Registry with every built-in workload. `recording` tests append to `log`.
pub fn builtin(log: &PhaseLog) -> WorkloadRegistry {
    let log = log.clone();
    let mut registry = WorkloadRegistry::new();
    registry
        .register("noop", |_| Ok(Arc::new(Noop) as Arc<dyn Workload>))
        .register("latency", |spec| Ok(Arc::new(Latency::from_spec(spec)?) as Arc<dyn Workload>))
        .register("failing", |spec| Ok(Arc::new(Failing::from_spec(spec)?) as Arc<dyn Workload>))
        .register("hanging", |spec| Ok(Arc::new(Hanging::from_spec(spec)?) as Arc<dyn Workload>))
        .register("recording", move |_| {
            Ok(Arc::new(Recording { log: log.clone() }) as Arc<dyn Workload>)
        })
        .register("storm", |spec| Ok(Arc::new(Storm::from_spec(spec)?) as Arc<dyn Workload>));
    registry
}

fn parse_property<T: FromStr>(spec: &TestSpec, key: &str) -> Result<Option<T>, WorkloadError> {
    spec.property(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| WorkloadError::failed(format!("invalid {} '{}'", key, value)))
        })
        .transpose()
}

fn worker_of(ctx: &TestContext) -> SimulatorAddress {
    ctx.address().worker_address().unwrap_or(ctx.address())
}

/// True when the test runs on the targeted worker, or no worker is targeted.
fn targeted(target: Option<u32>, ctx: &TestContext) -> bool {
    target.map_or(true, |index| ctx.address().worker_index() == index)
}

struct Noop;

impl Workload for Noop {
    fn run_iteration(&self, _ctx: &mut IterationContext) -> Result<(), WorkloadError> {
        Ok(())
    }
}

struct Latency {
    distribution: Exp<f64>,
    ceiling_us: f64,
}

impl Latency {
    fn from_spec(spec: &TestSpec) -> Result<Self, WorkloadError> {
        let mean_us: f64 = parse_property(spec, PROPERTY_MEAN_LATENCY_US)?.unwrap_or(200.0);
        if !mean_us.is_finite() || mean_us <= 0.0 {
            return Err(WorkloadError::failed(format!("{} must be positive", PROPERTY_MEAN_LATENCY_US)));
        }
        let distribution = Exp::new(1.0 / mean_us).map_err(|e| WorkloadError::failed(e.to_string()))?;
        Ok(Self {
            distribution,
            ceiling_us: mean_us * 10.0,
        })
    }
}

impl Workload for Latency {
    fn run_iteration(&self, ctx: &mut IterationContext) -> Result<(), WorkloadError> {
        let micros = self.distribution.sample(ctx.rng()).min(self.ceiling_us);
        std::thread::sleep(Duration::from_micros(micros as u64));
        Ok(())
    }
}

struct Failing {
    phase: Option<TestPhase>,
    iteration: Option<u64>,
    target: Option<u32>,
}

impl Failing {
    fn from_spec(spec: &TestSpec) -> Result<Self, WorkloadError> {
        let phase = parse_property(spec, PROPERTY_FAIL_PHASE)?;
        let iteration = parse_property(spec, PROPERTY_FAIL_ITERATION)?;
        if phase.is_none() && iteration.is_none() {
            return Err(WorkloadError::failed(format!(
                "failing needs {} or {}",
                PROPERTY_FAIL_PHASE, PROPERTY_FAIL_ITERATION
            )));
        }
        Ok(Self {
            phase,
            iteration,
            target: parse_property(spec, PROPERTY_TARGET_WORKER)?,
        })
    }
}

impl Workload for Failing {
    fn on_phase(&self, phase: TestPhase, ctx: &TestContext) -> Result<(), WorkloadError> {
        if self.phase == Some(phase) && targeted(self.target, ctx) {
            return Err(WorkloadError::failed(format!("{} failed on {}", phase, worker_of(ctx))));
        }
        Ok(())
    }

    fn run_iteration(&self, ctx: &mut IterationContext) -> Result<(), WorkloadError> {
        if self.iteration == Some(ctx.iteration()) && targeted(self.target, ctx.test()) {
            return Err(WorkloadError::failed(format!("iteration {} failed", ctx.iteration())));
        }
        std::thread::sleep(Duration::from_micros(100));
        Ok(())
    }
}

struct Hanging {
    phase: TestPhase,
    hang: Duration,
    target: Option<u32>,
}

impl Hanging {
    fn from_spec(spec: &TestSpec) -> Result<Self, WorkloadError> {
        Ok(Self {
            phase: parse_property(spec, PROPERTY_HANG_PHASE)?.unwrap_or(TestPhase::LocalPrepare),
            hang: Duration::from_millis(parse_property(spec, PROPERTY_HANG_MS)?.unwrap_or(1000)),
            target: parse_property(spec, PROPERTY_TARGET_WORKER)?,
        })
    }
}

impl Workload for Hanging {
    fn on_phase(&self, phase: TestPhase, ctx: &TestContext) -> Result<(), WorkloadError> {
        if phase == self.phase && targeted(self.target, ctx) {
            tracing::debug!(worker = %worker_of(ctx), %phase, hang = ?self.hang, "hanging");
            std::thread::sleep(self.hang);
        }
        Ok(())
    }

    fn run_iteration(&self, _ctx: &mut IterationContext) -> Result<(), WorkloadError> {
        std::thread::sleep(Duration::from_micros(100));
        Ok(())
    }
}

struct Recording {
    log: PhaseLog,
}

impl Workload for Recording {
    fn on_phase(&self, phase: TestPhase, ctx: &TestContext) -> Result<(), WorkloadError> {
        self.log.record(worker_of(ctx), phase);
        Ok(())
    }

    fn run_iteration(&self, _ctx: &mut IterationContext) -> Result<(), WorkloadError> {
        std::thread::sleep(Duration::from_micros(100));
        Ok(())
    }
}

struct Storm {
    pause: Duration,
}

impl Storm {
    fn from_spec(spec: &TestSpec) -> Result<Self, WorkloadError> {
        Ok(Self {
            pause: Duration::from_micros(parse_property(spec, PROPERTY_STORM_PAUSE_US)?.unwrap_or(100)),
        })
    }
}

impl Workload for Storm {
    fn run_iteration(&self, ctx: &mut IterationContext) -> Result<(), WorkloadError> {
        ctx.report_failure(WorkloadError::failed(format!(
            "storm failure {} on thread {}",
            ctx.iteration(),
            ctx.thread_index()
        )));
        std::thread::sleep(self.pause);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_core::failure::FailureReporter;

    fn context(spec: &TestSpec, worker: u32) -> TestContext {
        let address = SimulatorAddress::test(1, worker, 1);
        TestContext::new(spec, address, None, FailureReporter::shared(address))
    }

    #[test]
    fn test_builtin_names() {
        let registry = builtin(&PhaseLog::new());
        assert_eq!(
            registry.names(),
            vec!["failing", "hanging", "latency", "noop", "recording", "storm"]
        );
    }

    #[test]
    fn test_failing_targets_one_worker() {
        let spec = TestSpec::new("t", "failing")
            .with_property(PROPERTY_FAIL_PHASE, "local_prepare")
            .with_property(PROPERTY_TARGET_WORKER, 2);
        let workload = builtin(&PhaseLog::new()).create(&spec).unwrap();

        assert!(workload.on_phase(TestPhase::LocalPrepare, &context(&spec, 1)).is_ok());
        assert!(workload.on_phase(TestPhase::Setup, &context(&spec, 2)).is_ok());
        let err = workload
            .on_phase(TestPhase::LocalPrepare, &context(&spec, 2))
            .unwrap_err();
        assert!(err.to_string().contains("LOCAL_PREPARE"));
    }

    #[test]
    fn test_invalid_properties_are_rejected() {
        let registry = builtin(&PhaseLog::new());
        let bad_phase = TestSpec::new("t", "failing").with_property(PROPERTY_FAIL_PHASE, "lunch");
        assert!(registry.create(&bad_phase).is_err());
        assert!(registry.create(&TestSpec::new("t", "failing")).is_err());

        let bad_mean = TestSpec::new("t", "latency").with_property(PROPERTY_MEAN_LATENCY_US, 0);
        assert!(registry.create(&bad_mean).is_err());
        let bad_hang = TestSpec::new("t", "hanging").with_property(PROPERTY_HANG_MS, "soon");
        assert!(registry.create(&bad_hang).is_err());
    }

    #[test]
    fn test_recording_logs_per_worker() {
        let log = PhaseLog::new();
        let spec = TestSpec::new("t", "recording");
        let workload = builtin(&log).create(&spec).unwrap();

        workload.on_phase(TestPhase::Setup, &context(&spec, 1)).unwrap();
        workload.on_phase(TestPhase::Setup, &context(&spec, 2)).unwrap();
        workload.on_phase(TestPhase::LocalPrepare, &context(&spec, 1)).unwrap();

        assert_eq!(
            log.phases_on(SimulatorAddress::worker(1, 1)),
            vec![TestPhase::Setup, TestPhase::LocalPrepare]
        );
        assert_eq!(log.events().len(), 3);
        log.clear();
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_hanging_blocks_only_its_phase() {
        let spec = TestSpec::new("t", "hanging").with_property(PROPERTY_HANG_MS, 50);
        let workload = builtin(&PhaseLog::new()).create(&spec).unwrap();
        let ctx = context(&spec, 1);

        let start = std::time::Instant::now();
        workload.on_phase(TestPhase::Setup, &ctx).unwrap();
        assert!(start.elapsed() < Duration::from_millis(40));
        workload.on_phase(TestPhase::LocalPrepare, &ctx).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
