//! Routing envelope wrapping every operation.

use super::operation::Operation;
use serde::{Deserialize, Serialize};
use stampede_env::SimulatorAddress;

/// Delivery semantics of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Request,
    Response,
    FireAndForget,
}

/// Routing metadata of an envelope, available even when the payload is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub source: SimulatorAddress,
    pub destination: SimulatorAddress,
    pub correlation_id: u64,
    pub kind: MessageKind,
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub source: SimulatorAddress,
    pub destination: SimulatorAddress,
    /// Monotonic per source router; responses reuse the request's id
    pub correlation_id: u64,
    pub kind: MessageKind,
    pub payload: Operation,
}

impl MessageEnvelope {
    pub fn request(
        source: SimulatorAddress,
        destination: SimulatorAddress,
        correlation_id: u64,
        payload: Operation,
    ) -> Self {
        Self {
            source,
            destination,
            correlation_id,
            kind: MessageKind::Request,
            payload,
        }
    }

    pub fn fire_and_forget(
        source: SimulatorAddress,
        destination: SimulatorAddress,
        correlation_id: u64,
        payload: Operation,
    ) -> Self {
        Self {
            source,
            destination,
            correlation_id,
            kind: MessageKind::FireAndForget,
            payload,
        }
    }

    /// Builds the response to a request header, sent from `responder`.
    ///
    /// The responder is the concrete local address, which differs from the
    /// request's destination when the request was a broadcast.
    pub fn response(header: &EnvelopeHeader, responder: SimulatorAddress, payload: Operation) -> Self {
        Self {
            source: responder,
            destination: header.source,
            correlation_id: header.correlation_id,
            kind: MessageKind::Response,
            payload,
        }
    }

    pub fn header(&self) -> EnvelopeHeader {
        EnvelopeHeader {
            source: self.source,
            destination: self.destination,
            correlation_id: self.correlation_id,
            kind: self.kind,
        }
    }
}
