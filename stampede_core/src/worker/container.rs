//! One hosted test: its workload, probe and iteration threads.

use super::workload::{IterationContext, TestContext, Workload};
use crate::error::CoreError;
use crate::failure::FailureCause;
use crate::performance::{
    Metronome, MetronomeSettings, MetronomeStrategy, PerformanceSample, PerformanceTracker, Probe,
    SharedRate,
};
use crate::phase::TestPhase;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use stampede_env::mix_seed;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Per-thread pacing interval in milliseconds.
pub const PROPERTY_METRONOME_INTERVAL_MS: &str = "metronomeIntervalMs";
/// Operations per second shared by all threads of the test on this worker.
pub const PROPERTY_TOTAL_THROUGHPUT: &str = "totalThroughput";
/// `sleeping` (default) or `busy`.
pub const PROPERTY_METRONOME_STRATEGY: &str = "metronomeStrategy";

#[derive(Debug, Clone, Copy)]
enum Pacing {
    PerThread(MetronomeSettings),
    Shared { interval: Duration, strategy: MetronomeStrategy },
}

impl Pacing {
    /// One metronome per thread. A shared schedule starts when this is called.
    fn metronomes(&self, threads: usize) -> Vec<Box<dyn Metronome>> {
        match *self {
            Pacing::PerThread(settings) => (0..threads).map(|_| settings.build()).collect(),
            Pacing::Shared { interval, strategy } => {
                let rate = SharedRate::new(interval);
                (0..threads).map(|_| rate.metronome(strategy)).collect()
            }
        }
    }
}

/// Hosts one test on a worker.
///
/// Phase callbacks and iteration loops run on OS threads, never on the
/// async runtime. Every iteration is timed into the test's probe. An
/// iteration that fails or panics is reported and ends its thread; the
/// other threads keep going until the test is stopped.
pub struct TestContainer {
    context: Arc<TestContext>,
    workload: Arc<dyn Workload>,
    probe: Arc<Probe>,
    tracker: Mutex<PerformanceTracker>,
    thread_count: usize,
    pacing: Pacing,
    seed: u64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TestContainer {
    pub fn new(
        context: TestContext,
        workload: Arc<dyn Workload>,
        thread_count: usize,
        seed: u64,
    ) -> Result<Self, CoreError> {
        let pacing = Self::pacing(&context)?;
        let probe = Probe::new(format!("{}.latency", context.test_id()))?;
        Ok(Self {
            context: Arc::new(context),
            workload,
            probe: Arc::new(probe),
            tracker: Mutex::new(PerformanceTracker::new()),
            thread_count: thread_count.max(1),
            pacing,
            seed,
            threads: Mutex::new(Vec::new()),
        })
    }

    fn pacing(context: &TestContext) -> Result<Pacing, CoreError> {
        let strategy = match context.property(PROPERTY_METRONOME_STRATEGY) {
            Some(value) => value.parse::<MetronomeStrategy>().map_err(CoreError::config)?,
            None => MetronomeStrategy::default(),
        };

        if let Some(value) = context.property(PROPERTY_TOTAL_THROUGHPUT) {
            let ops_per_second: f64 = value.trim().parse().map_err(|_| {
                CoreError::config(format!("{} must be a number, got '{}'", PROPERTY_TOTAL_THROUGHPUT, value))
            })?;
            let settings = MetronomeSettings::with_frequency(ops_per_second).ok_or_else(|| {
                CoreError::config(format!("{} of {} is too low to pace", PROPERTY_TOTAL_THROUGHPUT, value))
            })?;
            return Ok(Pacing::Shared {
                interval: Self::checked_interval(settings.interval)?,
                strategy,
            });
        }

        let interval = match context.property(PROPERTY_METRONOME_INTERVAL_MS) {
            Some(value) => Duration::from_millis(value.trim().parse().map_err(|_| {
                CoreError::config(format!(
                    "{} must be a whole number, got '{}'",
                    PROPERTY_METRONOME_INTERVAL_MS, value
                ))
            })?),
            None => Duration::ZERO,
        };
        Ok(Pacing::PerThread(
            MetronomeSettings::with_interval(Self::checked_interval(interval)?).with_strategy(strategy),
        ))
    }

    /// Rejects intervals whose deadlines would overflow an [`Instant`].
    fn checked_interval(interval: Duration) -> Result<Duration, CoreError> {
        match Instant::now().checked_add(interval) {
            Some(_) => Ok(interval),
            None => Err(CoreError::config(format!("pacing interval {:?} is out of range", interval))),
        }
    }

    pub fn context(&self) -> &TestContext {
        &self.context
    }

    pub fn test_id(&self) -> &str {
        self.context.test_id()
    }

    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    /// Runs the workload's callback for a non-RUN phase on the calling thread.
    pub fn run_phase(&self, phase: TestPhase) -> Result<(), FailureCause> {
        tracing::debug!(test_id = self.test_id(), %phase, "running phase callback");
        match catch_unwind(AssertUnwindSafe(|| self.workload.on_phase(phase, &self.context))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FailureCause::Workload(e)),
            Err(payload) => Err(FailureCause::Panic(panic_message(payload.as_ref()))),
        }
    }

    /// Starts the iteration threads.
    pub fn start_run(&self) -> Result<(), CoreError> {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if !threads.is_empty() {
            return Err(CoreError::invalid_argument(format!(
                "test {} is already running",
                self.test_id()
            )));
        }

        self.context.stop_flag().store(false, Ordering::Release);
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .restart();

        let metronomes = self.pacing.metronomes(self.thread_count);
        for (thread_index, metronome) in metronomes.into_iter().enumerate() {
            let rng = ChaCha8Rng::seed_from_u64(mix_seed(self.seed, thread_index as u64));
            let iteration = IterationContext::new(
                Arc::clone(&self.context),
                thread_index,
                rng,
                Arc::clone(&self.probe),
            );
            let workload = Arc::clone(&self.workload);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.test_id(), thread_index))
                .spawn(move || iterate(workload, iteration, metronome))?;
            threads.push(handle);
        }

        tracing::info!(
            test_id = self.test_id(),
            threads = self.thread_count,
            pacing = ?self.pacing,
            "workload started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Signals the iteration threads to stop and joins them. Blocks until
    /// each thread finished its current iteration.
    pub fn stop_run(&self) {
        self.context.stop_flag().store(true, Ordering::Release);
        let threads: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let count = threads.len();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!(test_id = self.test_id(), "iteration thread panicked outside the workload");
            }
        }
        if count > 0 {
            tracing::info!(
                test_id = self.test_id(),
                operations = self.probe.operation_count(),
                "workload stopped"
            );
        }
    }

    /// Sample covering the time since the previous call.
    pub fn sample(&self) -> PerformanceSample {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sample(&self.probe)
    }
}

fn iterate(workload: Arc<dyn Workload>, mut ctx: IterationContext, mut metronome: Box<dyn Metronome>) {
    while !ctx.is_stopped() {
        metronome.wait_for_next();
        if ctx.is_stopped() {
            break;
        }

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| workload.run_iteration(&mut ctx)));
        ctx.probe().record(started.elapsed());

        let cause = match outcome {
            Ok(Ok(())) => {
                ctx.advance();
                continue;
            }
            Ok(Err(e)) => FailureCause::Workload(e),
            Err(payload) => FailureCause::Panic(panic_message(payload.as_ref())),
        };
        tracing::warn!(
            test_id = ctx.test().test_id(),
            thread = ctx.thread_index(),
            iteration = ctx.iteration(),
            "iteration failed, thread stopping"
        );
        ctx.test().reporter().report(cause, Some(ctx.test().test_id()));
        break;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
