//! Client side of the Tape Library Controller protocol.
//!
//! The TLC multiplexes SCSI access to one library and is reached over a
//! bytestream. Frames follow the same discipline as the client protocol
//! (version byte, u32 length, opaque payload) with the TLC's own version
//! byte. Only the request/response shape is defined here; the controller
//! itself is a separate service.

mod client;
mod messages;

pub use client::TlcClient;
pub use messages::{TlcRequest, TlcResponse, TLC_PROTOCOL_VERSION};
