//! Request and response envelopes exchanged with object-layer clients.

use serde::{Deserialize, Serialize};

use crate::types::{AddrType, Family, FsType, MediumId};

/// Client protocol version carried as the first byte of every frame.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// One medium of a write allocation: how much the client intends to
/// write and which tags the medium must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReq {
    pub size: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One medium of a release: what the client did with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMedium {
    pub id: MediumId,
    /// Bytes the client wrote since allocation.
    pub size_written: u64,
    /// Objects the client wrote since allocation.
    pub nb_obj: u64,
    /// Client-observed I/O status, errno-scale; non-zero poisons the batch.
    pub rc: i32,
    /// Whether the medium must be flushed before acknowledgement.
    pub to_sync: bool,
}

/// Device notifications from the admin tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOp {
    DeviceAdd,
    DeviceRemove,
}

/// Request kinds handled by the scheduler core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Ping,
    ReadAlloc {
        /// How many of the candidate media must be allocated.
        n_required: usize,
        /// Candidate media, in preference order.
        media: Vec<MediumId>,
    },
    WriteAlloc {
        family: Family,
        media: Vec<WriteReq>,
    },
    Release {
        media: Vec<ReleaseMedium>,
    },
    Format {
        medium: MediumId,
        fs: FsType,
        /// Clear the admin lock on the medium after a successful format.
        unlock: bool,
    },
    Notify {
        op: NotifyOp,
        device: String,
        family: Family,
    },
}

impl Request {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::ReadAlloc { .. } => "read_alloc",
            Self::WriteAlloc { .. } => "write_alloc",
            Self::Release { .. } => "release",
            Self::Format { .. } => "format",
            Self::Notify { .. } => "notify",
        }
    }
}

/// One allocated medium in an allocation response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedMedium {
    pub id: MediumId,
    pub fs: FsType,
    pub addr: AddrType,
    /// Mount point under which the client performs its I/O.
    pub root_path: String,
    /// Available bytes; write allocations only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avail: Option<u64>,
}

/// Response kinds, mirroring the requests plus `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Ping,
    ReadAlloc { media: Vec<AllocatedMedium> },
    WriteAlloc { media: Vec<AllocatedMedium> },
    Release { media: Vec<MediumId> },
    Format { medium: MediumId },
    Notify,
    Error { code: i32, message: String },
}

impl Response {
    /// Builds an error response from an errno value.
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.abs(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// A request frame: correlation id plus body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub req_id: u64,
    pub body: Request,
}

/// A response frame: correlation id plus body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub req_id: u64,
    pub body: Response,
}
