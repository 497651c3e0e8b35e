//! Lifecycle phases of a distributed test.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named stage of a test's lifecycle.
///
/// Declaration order is execution order. LOCAL phases (plus SETUP and RUN)
/// run on every worker hosting the test; GLOBAL phases run on exactly one
/// designated worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestPhase {
    Setup,
    LocalPrepare,
    GlobalPrepare,
    LocalWarmup,
    GlobalWarmup,
    Run,
    LocalVerify,
    GlobalVerify,
    LocalTeardown,
    GlobalTeardown,
}

impl TestPhase {
    /// Every phase in execution order.
    pub const ALL: [TestPhase; 10] = [
        TestPhase::Setup,
        TestPhase::LocalPrepare,
        TestPhase::GlobalPrepare,
        TestPhase::LocalWarmup,
        TestPhase::GlobalWarmup,
        TestPhase::Run,
        TestPhase::LocalVerify,
        TestPhase::GlobalVerify,
        TestPhase::LocalTeardown,
        TestPhase::GlobalTeardown,
    ];

    /// True if the phase runs on a single designated worker.
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            TestPhase::GlobalPrepare
                | TestPhase::GlobalWarmup
                | TestPhase::GlobalVerify
                | TestPhase::GlobalTeardown
        )
    }

    pub fn is_verify(&self) -> bool {
        matches!(self, TestPhase::LocalVerify | TestPhase::GlobalVerify)
    }

    /// Teardown phases always run, even after an abort.
    pub fn is_teardown(&self) -> bool {
        matches!(self, TestPhase::LocalTeardown | TestPhase::GlobalTeardown)
    }

    /// Returns the following phase, or `None` after GLOBAL_TEARDOWN.
    pub fn next(&self) -> Option<TestPhase> {
        let position = Self::ALL.iter().position(|p| p == self)?;
        Self::ALL.get(position + 1).copied()
    }

    /// Wire name, e.g. `LOCAL_PREPARE`.
    pub fn name(&self) -> &'static str {
        match self {
            TestPhase::Setup => "SETUP",
            TestPhase::LocalPrepare => "LOCAL_PREPARE",
            TestPhase::GlobalPrepare => "GLOBAL_PREPARE",
            TestPhase::LocalWarmup => "LOCAL_WARMUP",
            TestPhase::GlobalWarmup => "GLOBAL_WARMUP",
            TestPhase::Run => "RUN",
            TestPhase::LocalVerify => "LOCAL_VERIFY",
            TestPhase::GlobalVerify => "GLOBAL_VERIFY",
            TestPhase::LocalTeardown => "LOCAL_TEARDOWN",
            TestPhase::GlobalTeardown => "GLOBAL_TEARDOWN",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TestPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown phase: {}", s))
    }
}
