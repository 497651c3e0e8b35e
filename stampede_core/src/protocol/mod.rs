//! Wire protocol: operations, envelopes and the codec.

mod codec;
mod envelope;
mod operation;

pub use codec::{EnvelopeCodec, JsonCodec};
pub use envelope::{EnvelopeHeader, MessageEnvelope, MessageKind};
pub use operation::{Operation, Reply, ReplyStatus, TestSpec};
