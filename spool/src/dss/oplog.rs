//! Structured operation logs emitted alongside device/library calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of hardware operation being logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    LibraryOpen,
    LibraryScan,
    MediumLookup,
    DeviceLookup,
    DeviceLoad,
    DeviceUnload,
    Mount,
    Umount,
    Format,
    Sync,
}

/// One operation log row: which device touched which medium, the outcome,
/// and an adapter-provided JSON message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLog {
    pub device: String,
    pub medium: Option<String>,
    pub op: OperationKind,
    /// 0 on success, positive errno otherwise.
    pub error: i32,
    pub message: Value,
    pub at: DateTime<Utc>,
}

impl OperationLog {
    pub fn new(op: OperationKind, device: impl Into<String>, medium: Option<String>) -> Self {
        Self {
            device: device.into(),
            medium,
            op,
            error: 0,
            message: Value::Null,
            at: Utc::now(),
        }
    }

    pub fn with_error(mut self, errno: i32) -> Self {
        self.error = errno.abs();
        self
    }

    pub fn with_message(mut self, message: Value) -> Self {
        self.message = message;
        self
    }

    /// Whether the row is worth persisting: only errors or rows carrying
    /// an adapter message are.
    pub fn should_persist(&self) -> bool {
        self.error != 0 || !self.message.is_null()
    }
}
