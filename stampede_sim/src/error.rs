//! Errors raised by the simulation harness.

use stampede_core::CoreError;
use stampede_env::EnvError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Env(#[from] EnvError),

    /// Cluster shape or scenario parameters are unusable
    #[error("Invalid simulation config: {0}")]
    Config(String),

    #[error("Unknown scenario '{0}'")]
    UnknownScenario(String),

    #[error("Export failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Export encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
