//! Worker process: hosts tests and runs their workloads.

mod container;
mod runtime;
mod workload;

pub use container::{
    TestContainer, PROPERTY_METRONOME_INTERVAL_MS, PROPERTY_METRONOME_STRATEGY,
    PROPERTY_TOTAL_THROUGHPUT,
};
pub use runtime::{WorkerConfig, WorkerRuntime};
pub use workload::{
    IterationContext, TargetDriver, TestContext, Workload, WorkloadFactory, WorkloadRegistry,
};
