//! Iteration pacing.
//!
//! A metronome blocks the calling thread until its next tick. Ticks are
//! fixed-delay: the next tick is due one interval after the previous call
//! returned, so consecutive returns are never closer than the interval.
//! [`SharedRate`] instead hands out numbered slots on a common schedule,
//! splitting one global rate across any number of callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Blocks callers until the next scheduled tick.
pub trait Metronome: Send {
    fn wait_for_next(&mut self);

    /// Interval between ticks; zero for a metronome that never blocks.
    fn interval(&self) -> Duration;
}

/// How a metronome waits for its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetronomeStrategy {
    /// `thread::sleep`: low CPU, coarse
    #[default]
    Sleeping,
    /// Spin on the clock: one core busy, fine-grained
    BusySpinning,
}

impl std::str::FromStr for MetronomeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sleep" | "sleeping" => Ok(Self::Sleeping),
            "busy" | "busy_spin" | "busyspinning" => Ok(Self::BusySpinning),
            other => Err(format!("unknown metronome strategy: {}", other)),
        }
    }
}

fn wait_until(deadline: Instant, strategy: MetronomeStrategy) {
    match strategy {
        MetronomeStrategy::Sleeping => loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(deadline - now);
        },
        MetronomeStrategy::BusySpinning => {
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }
        }
    }
}

/// Never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyMetronome;

impl Metronome for EmptyMetronome {
    fn wait_for_next(&mut self) {}

    fn interval(&self) -> Duration {
        Duration::ZERO
    }
}

/// Fixed-delay metronome that sleeps until each tick.
#[derive(Debug)]
pub struct SleepingMetronome {
    interval: Duration,
    last_tick: Option<Instant>,
}

impl SleepingMetronome {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: None,
        }
    }
}

impl Metronome for SleepingMetronome {
    fn wait_for_next(&mut self) {
        if let Some(last) = self.last_tick {
            wait_until(last + self.interval, MetronomeStrategy::Sleeping);
        }
        self.last_tick = Some(Instant::now());
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Fixed-delay metronome that spins until each tick.
#[derive(Debug)]
pub struct BusySpinningMetronome {
    interval: Duration,
    last_tick: Option<Instant>,
}

impl BusySpinningMetronome {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: None,
        }
    }
}

impl Metronome for BusySpinningMetronome {
    fn wait_for_next(&mut self) {
        if let Some(last) = self.last_tick {
            wait_until(last + self.interval, MetronomeStrategy::BusySpinning);
        }
        self.last_tick = Some(Instant::now());
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Pacing configuration for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetronomeSettings {
    pub interval: Duration,
    pub strategy: MetronomeStrategy,
}

impl MetronomeSettings {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            strategy: MetronomeStrategy::default(),
        }
    }

    /// Paces at `ops_per_second`; zero or negative disables pacing.
    ///
    /// Returns `None` when the rate is so low that its interval does not
    /// fit in a [`Duration`].
    pub fn with_frequency(ops_per_second: f64) -> Option<Self> {
        let interval = if ops_per_second > 0.0 && ops_per_second.is_finite() {
            Duration::try_from_secs_f64(1.0 / ops_per_second).ok()?
        } else {
            Duration::ZERO
        };
        Some(Self::with_interval(interval))
    }

    pub fn with_strategy(mut self, strategy: MetronomeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn build(&self) -> Box<dyn Metronome> {
        if self.interval.is_zero() {
            return Box::new(EmptyMetronome);
        }
        match self.strategy {
            MetronomeStrategy::Sleeping => Box::new(SleepingMetronome::new(self.interval)),
            MetronomeStrategy::BusySpinning => Box::new(BusySpinningMetronome::new(self.interval)),
        }
    }
}

/// One global rate shared by many callers.
///
/// Slot `n` is due at `start + n * interval`. Slots are claimed with a
/// single atomic increment, so they are strictly increasing and gap-free
/// in claim order.
#[derive(Debug)]
pub struct SharedRate {
    start: Instant,
    interval: Duration,
    next_slot: AtomicU64,
}

impl SharedRate {
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            interval,
            next_slot: AtomicU64::new(0),
        })
    }

    /// Claims the next slot and returns it with its deadline.
    pub fn claim(&self) -> (u64, Instant) {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        (slot, self.start + self.offset(slot))
    }

    /// `slot * interval`, saturating at `u64::MAX` nanoseconds.
    fn offset(&self, slot: u64) -> Duration {
        let nanos = self.interval.as_nanos().saturating_mul(u128::from(slot));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Slots handed out so far.
    pub fn claimed(&self) -> u64 {
        self.next_slot.load(Ordering::Relaxed)
    }

    /// Creates a caller handle; a zero interval yields an [`EmptyMetronome`].
    pub fn metronome(self: &Arc<Self>, strategy: MetronomeStrategy) -> Box<dyn Metronome> {
        if self.interval.is_zero() {
            return Box::new(EmptyMetronome);
        }
        Box::new(SharedRateMetronome {
            rate: Arc::clone(self),
            strategy,
        })
    }
}

struct SharedRateMetronome {
    rate: Arc<SharedRate>,
    strategy: MetronomeStrategy,
}

impl Metronome for SharedRateMetronome {
    fn wait_for_next(&mut self) {
        let (_, deadline) = self.rate.claim();
        wait_until(deadline, self.strategy);
    }

    fn interval(&self) -> Duration {
        self.rate.interval
    }
}
