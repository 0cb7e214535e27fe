//! JSON codec for wire messages.
//!
//! One encoded message maps to one transport frame; framing is the
//! transport's job. Decode dispatches on the `type` discriminant and
//! fails with a distinguishable error on malformed input, which the
//! dispatch loop logs and drops without stopping.

use thiserror::Error;

use crate::Message;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode a message into one wire frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(CodecError::Encode)
}

/// Decode one wire frame into a message.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
