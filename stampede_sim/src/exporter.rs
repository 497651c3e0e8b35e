//! JSON export of scenario results.
//!
//! Each result carries the full [`RunOutcome`](stampede_core::RunOutcome):
//! completed and skipped phases, the failure summary and the final
//! performance sample.

use crate::error::SimError;
use crate::runner::ScenarioResult;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Complete export of one CLI invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SimExport {
    /// First seed used
    pub base_seed: u64,

    pub total: usize,
    pub passed: usize,
    pub failed: usize,

    pub results: Vec<ScenarioResult>,
}

impl SimExport {
    pub fn new(base_seed: u64) -> Self {
        Self {
            base_seed,
            total: 0,
            passed: 0,
            failed: 0,
            results: Vec::new(),
        }
    }

    pub fn add(&mut self, result: ScenarioResult) {
        self.total += 1;
        if result.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn to_json(&self) -> Result<String, SimError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let json = self.to_json()?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::ScenarioId;

    fn result(scenario: ScenarioId, passed: bool) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: 3,
            passed,
            failure_reason: (!passed).then(|| "boom".to_string()),
            outcome: None,
            elapsed_ms: 12,
        }
    }

    #[test]
    fn test_counts_and_file() {
        let mut export = SimExport::new(3);
        export.add(result(ScenarioId::Baseline, true));
        export.add(result(ScenarioId::Paced, false));
        assert_eq!((export.total, export.passed, export.failed), (2, 1, 1));
        assert!(!export.all_passed());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        export.write_to_file(&path).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["results"][0]["scenario"], "baseline");
        assert_eq!(value["results"][1]["failure_reason"], "boom");
        assert!(value["results"][0].get("failure_reason").is_none());
    }
}
