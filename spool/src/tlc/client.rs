//! Bytestream client for the tape library controller.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::config::TlcSettings;
use crate::error::{CodedError, OpResult};
use crate::protocol::EnvelopeCodec;

use super::messages::{TlcRequest, TlcResponse, TLC_PROTOCOL_VERSION};

/// A connected TLC session.
///
/// The TLC serves one response per request in order, so the framed stream
/// sits behind a mutex and each call owns the connection for its full
/// round trip.
#[derive(Debug)]
pub struct TlcClient {
    stream: Mutex<Framed<TcpStream, EnvelopeCodec>>,
    endpoint: String,
}

impl TlcClient {
    /// Connects to the controller named in the `tlc` configuration
    /// section.
    pub async fn connect(settings: &TlcSettings, timeout: Duration) -> OpResult<Self> {
        let endpoint = format!("{}:{}", settings.hostname, settings.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| CodedError::timed_out(format!("connect to TLC at {endpoint}")))?
            .map_err(|e| CodedError::from_io(e, format!("connect to TLC at {endpoint}")))?;
        debug!(endpoint = %endpoint, "connected to TLC");
        Ok(Self {
            stream: Mutex::new(Framed::new(
                stream,
                EnvelopeCodec::new(TLC_PROTOCOL_VERSION),
            )),
            endpoint,
        })
    }

    /// Sends one request and waits for its response, bounded by `timeout`.
    pub async fn call(&self, request: &TlcRequest, timeout: Duration) -> OpResult<TlcResponse> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| CodedError::invalid(format!("cannot serialize TLC request: {e}")))?;

        let mut stream = self.stream.lock().await;
        tokio::time::timeout(timeout, stream.send(Bytes::from(payload)))
            .await
            .map_err(|_| CodedError::timed_out(format!("send to TLC at {}", self.endpoint)))?
            .map_err(|e| CodedError::from_io(e, "send to TLC"))?;

        let frame = tokio::time::timeout(timeout, stream.next())
            .await
            .map_err(|_| CodedError::timed_out(format!("wait for TLC at {}", self.endpoint)))?
            .ok_or_else(|| CodedError::io("TLC closed the connection"))?
            .map_err(|e| CodedError::from_io(e, "receive from TLC"))?;

        let response: TlcResponse = serde_json::from_slice(&frame)
            .map_err(|e| CodedError::invalid(format!("malformed TLC response: {e}")))?;

        if let TlcResponse::Error { code, message } = &response {
            return Err(CodedError::new(*code, message.clone()));
        }
        Ok(response)
    }
}
