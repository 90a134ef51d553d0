//! Client wire protocol.
//!
//! Framing is one protocol-version byte followed by a u32 big-endian
//! length and an opaque serialized payload. The payload schema is owned by
//! the object layer; this module (de)serializes it as JSON but the framing
//! layer never looks inside. A version mismatch is answered with
//! `-EPROTONOSUPPORT` and the connection is left open.

mod codec;
mod messages;

pub use codec::{EnvelopeCodec, VersionMismatch, MAX_FRAME_SIZE};
pub use messages::{
    AllocatedMedium, NotifyOp, ReleaseMedium, Request, RequestEnvelope, Response,
    ResponseEnvelope, WriteReq, PROTOCOL_VERSION,
};

use bytes::Bytes;

use crate::error::{CodedError, OpResult};

/// Serializes a request envelope into a frame payload.
pub fn encode_request(envelope: &RequestEnvelope) -> OpResult<Bytes> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| CodedError::invalid(format!("cannot serialize request: {e}")))
}

/// Parses a frame payload into a request envelope.
pub fn decode_request(payload: &[u8]) -> OpResult<RequestEnvelope> {
    serde_json::from_slice(payload)
        .map_err(|e| CodedError::invalid(format!("malformed request payload: {e}")))
}

/// Serializes a response envelope into a frame payload.
pub fn encode_response(envelope: &ResponseEnvelope) -> OpResult<Bytes> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| CodedError::invalid(format!("cannot serialize response: {e}")))
}

/// Parses a frame payload into a response envelope.
pub fn decode_response(payload: &[u8]) -> OpResult<ResponseEnvelope> {
    serde_json::from_slice(payload)
        .map_err(|e| CodedError::invalid(format!("malformed response payload: {e}")))
}
