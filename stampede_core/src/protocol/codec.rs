//! Envelope serialization.

use super::envelope::{EnvelopeHeader, MessageEnvelope, MessageKind};
use super::operation::Operation;
use crate::error::CodecError;
use serde::Deserialize;
use stampede_env::{Frame, SimulatorAddress};

/// Encodes envelopes to frames and back.
pub trait EnvelopeCodec: Send + Sync + 'static {
    fn encode(&self, envelope: &MessageEnvelope) -> Result<Frame, CodecError>;

    /// Decodes a frame.
    ///
    /// Unknown operation tags yield [`CodecError::UnsupportedOperation`]
    /// with the routing header attached; anything else unreadable yields
    /// [`CodecError::Malformed`].
    fn decode(&self, bytes: &[u8]) -> Result<MessageEnvelope, CodecError>;
}

/// Self-describing JSON envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

/// Envelope with the payload left undecoded, so the header survives an
/// unknown tag.
#[derive(Deserialize)]
struct RawEnvelope {
    source: SimulatorAddress,
    destination: SimulatorAddress,
    correlation_id: u64,
    kind: MessageKind,
    payload: serde_json::Value,
}

impl EnvelopeCodec for JsonCodec {
    fn encode(&self, envelope: &MessageEnvelope) -> Result<Frame, CodecError> {
        serde_json::to_vec(envelope).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<MessageEnvelope, CodecError> {
        let raw: RawEnvelope =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let header = EnvelopeHeader {
            source: raw.source,
            destination: raw.destination,
            correlation_id: raw.correlation_id,
            kind: raw.kind,
        };

        let tag = raw
            .payload
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CodecError::Malformed("payload has no op tag".to_string()))?;
        if !Operation::is_supported_tag(tag) {
            return Err(CodecError::UnsupportedOperation {
                tag: tag.to_string(),
                header: Some(header),
            });
        }

        let payload: Operation = serde_json::from_value(raw.payload)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;

        Ok(MessageEnvelope {
            source: header.source,
            destination: header.destination,
            correlation_id: header.correlation_id,
            kind: header.kind,
            payload,
        })
    }
}
