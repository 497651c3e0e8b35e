//! Error types for the Stampede orchestration engine.

use crate::protocol::{EnvelopeHeader, ReplyStatus};
use stampede_env::{EnvError, SimulatorAddress};
use std::time::Duration;
use thiserror::Error;

/// Errors produced while decoding an envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Bytes were not a well-formed envelope or payload
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// Payload carried an operation tag this endpoint does not know
    #[error("Unsupported operation '{tag}'")]
    UnsupportedOperation {
        tag: String,
        /// Routing header, so the receiver can still answer the sender
        header: Option<EnvelopeHeader>,
    },
}

/// Errors surfaced through a [`Promise`](crate::router::Promise) or a send.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No response arrived before the promise deadline
    #[error("Request {correlation_id} timed out after {after:?}")]
    Timeout { correlation_id: u64, after: Duration },

    /// No link leads toward the destination
    #[error("No route to {0}")]
    Unreachable(SimulatorAddress),

    /// Router or promise table was shut down
    #[error("Router closed")]
    Closed,

    /// Remote handler answered with a non-success status
    #[error("Remote replied {status}: {message}")]
    Remote { status: ReplyStatus, message: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Env(#[from] EnvError),
}

/// Errors raised by workload code and target drivers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkloadError {
    #[error("{0}")]
    Failed(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Unknown workload '{0}'")]
    UnknownWorkload(String),

    #[error("Target driver error: {0}")]
    Driver(String),
}

impl WorkloadError {
    /// Creates a generic workload failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Top-level error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Workload(#[from] WorkloadError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration was incomplete or inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
