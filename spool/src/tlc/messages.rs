//! TLC request/response shape.

use serde::{Deserialize, Serialize};

/// TLC protocol version carried as the first byte of every frame.
pub const TLC_PROTOCOL_VERSION: u8 = 0x01;

/// Requests understood by the tape library controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TlcRequest {
    Ping,
    /// Address and content of the drive holding `serial`.
    DriveLookup { serial: String },
    /// Address of the medium labelled `label`.
    MediaLookup { label: String },
    /// Move a medium between two element addresses; `to = None` lets the
    /// controller pick a free slot.
    Move { from: u16, to: Option<u16> },
    /// Full inventory; `refresh` forces a new element status pass.
    Status { refresh: bool },
}

/// Responses mirroring [`TlcRequest`], plus `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TlcResponse {
    Ping {
        library_is_up: bool,
    },
    DriveLookup {
        addr: u16,
        loaded_medium: Option<String>,
    },
    MediaLookup {
        addr: u16,
        in_drive: bool,
    },
    Move,
    Status {
        inventory: serde_json::Value,
    },
    Error {
        code: i32,
        message: String,
    },
}
