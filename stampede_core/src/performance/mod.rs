//! Latency probes, sample aggregation and iteration pacing.

mod collector;
mod metronome;
mod probe;
mod sample;
mod tracker;

pub use collector::PerformanceCollector;
pub use metronome::{
    BusySpinningMetronome, EmptyMetronome, Metronome, MetronomeSettings, MetronomeStrategy,
    SharedRate, SleepingMetronome,
};
pub use probe::{now_nanos, Probe, ProbeSnapshot, MAX_TRACKABLE_NANOS, SIGNIFICANT_DIGITS};
pub use sample::PerformanceSample;
pub use tracker::PerformanceTracker;
