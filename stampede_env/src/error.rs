//! Error types for the Stampede environment layer.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Target endpoint is unreachable (severed link or no route)
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// Link was closed by the peer or by shutdown
    #[error("Link closed: {0}")]
    LinkClosed(String),

    /// Connection handshake did not yield a valid peer address
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Frame exceeded the maximum accepted size
    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// Socket-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvError {
    /// Creates an unreachable error.
    pub fn unreachable(node: impl std::fmt::Display) -> Self {
        Self::NodeUnreachable(node.to_string())
    }

    /// Creates a closed-link error.
    pub fn closed(node: impl std::fmt::Display) -> Self {
        Self::LinkClosed(node.to_string())
    }
}
