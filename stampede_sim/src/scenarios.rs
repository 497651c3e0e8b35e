//! Orchestration scenarios run against a simulated cluster.

use crate::error::SimError;
use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Every phase completes on every worker, in order
    Baseline,

    /// A critical failure during RUN aborts the run; teardown still runs
    CriticalFailure,

    /// A prepare failure, declared tolerable, lets the run finish
    ToleratedFailure,

    /// A worker outlives the phase timeout; the run skips to teardown
    PhaseTimeout,

    /// Workers flood failures; the per-process cap bounds what arrives
    FailureStorm,

    /// Shared-rate pacing holds throughput near the requested rate
    Paced,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Baseline,
            ScenarioId::CriticalFailure,
            ScenarioId::ToleratedFailure,
            ScenarioId::PhaseTimeout,
            ScenarioId::FailureStorm,
            ScenarioId::Paced,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Baseline => "baseline",
            ScenarioId::CriticalFailure => "critical_failure",
            ScenarioId::ToleratedFailure => "tolerated_failure",
            ScenarioId::PhaseTimeout => "phase_timeout",
            ScenarioId::FailureStorm => "failure_storm",
            ScenarioId::Paced => "paced",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Baseline => "Recording workload, all ten phases, global phases on one worker",
            ScenarioId::CriticalFailure => "An iteration fails on one worker during RUN, nothing tolerated",
            ScenarioId::ToleratedFailure => "LOCAL_PREPARE fails on one worker, EXCEPTION tolerated",
            ScenarioId::PhaseTimeout => "LOCAL_PREPARE hangs past the phase timeout on one worker",
            ScenarioId::FailureStorm => "Every iteration reports a failure; reporters cap the flood",
            ScenarioId::Paced => "Latency workload paced by a shared per-worker rate",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "baseline" => Ok(ScenarioId::Baseline),
            "critical_failure" | "critical" => Ok(ScenarioId::CriticalFailure),
            "tolerated_failure" | "tolerated" => Ok(ScenarioId::ToleratedFailure),
            "phase_timeout" | "timeout" => Ok(ScenarioId::PhaseTimeout),
            "failure_storm" | "storm" => Ok(ScenarioId::FailureStorm),
            "paced" => Ok(ScenarioId::Paced),
            _ => Err(SimError::UnknownScenario(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_aliases() {
        assert_eq!("storm".parse::<ScenarioId>().unwrap(), ScenarioId::FailureStorm);
        assert_eq!("Phase-Timeout".parse::<ScenarioId>().unwrap(), ScenarioId::PhaseTimeout);
        assert!(matches!(
            "split_brain".parse::<ScenarioId>(),
            Err(SimError::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_serializes_by_name() {
        for scenario in ScenarioId::all() {
            let json = serde_json::to_string(&scenario).unwrap();
            assert_eq!(json, format!("\"{}\"", scenario.name()));
        }
    }

    proptest! {
        #[test]
        fn prop_name_parses_back(index in 0usize..6) {
            let scenario = ScenarioId::all()[index];
            prop_assert_eq!(scenario.name().parse::<ScenarioId>().unwrap(), scenario);
            prop_assert_eq!(scenario.to_string().to_uppercase().parse::<ScenarioId>().unwrap(), scenario);
        }
    }
}
