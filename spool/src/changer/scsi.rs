//! Tape-library changer driven through the TLC.
//!
//! The TLC session is opened lazily on the first operation and reopened
//! after a connection loss; each operation carries the deadline configured
//! for its class (`scsi/query_timeout_ms`, `scsi/move_timeout_ms`).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::{ScsiSettings, TlcSettings};
use crate::error::{CodedError, OpResult};
use crate::tlc::{TlcClient, TlcRequest, TlcResponse};

use super::{DriveLookup, ElementAddr, MediaChanger};

/// Changer adapter backed by a TLC session.
pub struct ScsiChanger {
    tlc: TlcSettings,
    scsi: ScsiSettings,
    client: Mutex<Option<TlcClient>>,
}

impl ScsiChanger {
    pub fn new(tlc: TlcSettings, scsi: ScsiSettings) -> Self {
        Self {
            tlc,
            scsi,
            client: Mutex::new(None),
        }
    }

    /// Runs one TLC call on the cached session, reconnecting once when the
    /// session is gone.
    async fn call(&self, request: &TlcRequest, timeout: Duration) -> OpResult<TlcResponse> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(TlcClient::connect(&self.tlc, self.scsi.query_timeout).await?);
        }
        let client = guard.as_ref().unwrap();
        match client.call(request, timeout).await {
            Ok(resp) => Ok(resp),
            Err(err) if err.code() == libc::EIO || err.code() == libc::EPIPE => {
                // Session died; drop it so the next operation reconnects.
                warn!(error = %err, "TLC session lost, will reconnect");
                *guard = None;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn element_number(addr: ElementAddr, what: &str) -> OpResult<u16> {
        match addr {
            ElementAddr::Drive(n) | ElementAddr::Slot(n) => Ok(n),
            ElementAddr::Unknown => Err(CodedError::invalid(format!(
                "move {what} needs a concrete element address"
            ))),
        }
    }
}

#[async_trait]
impl MediaChanger for ScsiChanger {
    async fn drive_lookup(&self, serial: &str) -> OpResult<DriveLookup> {
        let resp = self
            .call(
                &TlcRequest::DriveLookup {
                    serial: serial.to_string(),
                },
                self.scsi.query_timeout,
            )
            .await?;
        match resp {
            TlcResponse::DriveLookup {
                addr,
                loaded_medium,
            } => Ok(DriveLookup {
                addr: ElementAddr::Drive(addr),
                loaded_medium,
            }),
            other => Err(CodedError::proto(format!(
                "unexpected TLC answer to drive_lookup: {other:?}"
            ))),
        }
    }

    async fn media_lookup(&self, label: &str) -> OpResult<ElementAddr> {
        let resp = self
            .call(
                &TlcRequest::MediaLookup {
                    label: label.to_string(),
                },
                self.scsi.query_timeout,
            )
            .await?;
        match resp {
            TlcResponse::MediaLookup { addr, in_drive } => Ok(if in_drive {
                ElementAddr::Drive(addr)
            } else {
                ElementAddr::Slot(addr)
            }),
            other => Err(CodedError::proto(format!(
                "unexpected TLC answer to media_lookup: {other:?}"
            ))),
        }
    }

    async fn media_move(&self, from: ElementAddr, to: ElementAddr) -> OpResult<()> {
        let from = Self::element_number(from, "source")?;
        let to = match to {
            ElementAddr::Unknown => None,
            concrete => Some(Self::element_number(concrete, "destination")?),
        };
        let resp = self
            .call(&TlcRequest::Move { from, to }, self.scsi.move_timeout)
            .await?;
        match resp {
            TlcResponse::Move => Ok(()),
            other => Err(CodedError::proto(format!(
                "unexpected TLC answer to move: {other:?}"
            ))),
        }
    }

    async fn scan(&self) -> OpResult<serde_json::Value> {
        let resp = self
            .call(&TlcRequest::Status { refresh: true }, self.scsi.query_timeout)
            .await?;
        match resp {
            TlcResponse::Status { inventory } => Ok(inventory),
            other => Err(CodedError::proto(format!(
                "unexpected TLC answer to status: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_source_is_rejected() {
        let err = ScsiChanger::element_number(ElementAddr::Unknown, "source").unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn test_concrete_addresses_extract() {
        assert_eq!(
            ScsiChanger::element_number(ElementAddr::Drive(2), "source").unwrap(),
            2
        );
        assert_eq!(
            ScsiChanger::element_number(ElementAddr::Slot(1024), "source").unwrap(),
            1024
        );
    }
}
