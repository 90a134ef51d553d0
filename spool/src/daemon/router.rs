//! The request router: drains client connections into the per-family
//! scheduler queues and writes responses back.
//!
//! Each client connection gets a reader task (frames in, containers out)
//! and a writer channel. A client closing mid-request cancels its
//! outstanding containers; their responses are discarded when they
//! surface. Protocol errors (wrong version byte, malformed payload) are
//! answered on the spot and leave the connection open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ListenAddr;
use crate::error::CodedError;
use crate::protocol::{
    decode_request, encode_response, EnvelopeCodec, Request, Response, ResponseEnvelope,
    PROTOCOL_VERSION,
};
use crate::queue::TsQueue;
use crate::sched::request::{ClientId, ReqContainer, RespContainer};
use crate::types::Family;

/// The bound listener, filesystem socket or TCP.
pub enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Binds the configured listening address.
    pub async fn bind(addr: &ListenAddr) -> Result<Self, CodedError> {
        match addr {
            ListenAddr::Unix(path) => {
                // A stale socket file from a crashed daemon would make
                // bind fail; the lock file already guarantees mutual
                // exclusion.
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path).map_err(|e| {
                    CodedError::from_io(e, format!("bind '{}'", path.display()))
                })?;
                info!(path = %path.display(), "listening on unix socket");
                Ok(Self::Unix(listener))
            }
            ListenAddr::Tcp { host, port } => {
                let endpoint = format!("{host}:{port}");
                let listener = TcpListener::bind(&endpoint)
                    .await
                    .map_err(|e| CodedError::from_io(e, format!("bind '{endpoint}'")))?;
                info!(endpoint = %endpoint, "listening on tcp");
                Ok(Self::Tcp(listener))
            }
        }
    }
}

struct ClientSlot {
    sender: mpsc::UnboundedSender<ResponseEnvelope>,
    outstanding: Vec<Weak<ReqContainer>>,
}

/// Routes request frames to family schedulers and responses back.
pub struct Router {
    queues: HashMap<Family, Arc<TsQueue<Arc<ReqContainer>>>>,
    responses: Arc<TsQueue<RespContainer>>,
    clients: Mutex<HashMap<ClientId, ClientSlot>>,
    next_client: AtomicU64,
}

impl Router {
    pub fn new(
        queues: HashMap<Family, Arc<TsQueue<Arc<ReqContainer>>>>,
        responses: Arc<TsQueue<RespContainer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues,
            responses,
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
        })
    }

    /// Accept loop; stops accepting when `shutdown` fires but leaves
    /// open connections alive so releases can still come in.
    pub async fn serve(self: Arc<Self>, listener: Listener, shutdown: CancellationToken) {
        match listener {
            Listener::Unix(listener) => loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(Arc::clone(&self).serve_connection(stream));
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            break;
                        }
                    },
                }
            },
            Listener::Tcp(listener) => loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(Arc::clone(&self).serve_connection(stream));
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            break;
                        }
                    },
                }
            },
        }
        debug!("listener closed");
    }

    /// One client connection: reads frames, routes them, and writes the
    /// responses its channel receives.
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let client = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<ResponseEnvelope>();
        self.clients.lock().insert(
            client,
            ClientSlot {
                sender: tx.clone(),
                outstanding: Vec::new(),
            },
        );
        debug!(client, "client connected");

        let mut framed = Framed::new(stream, EnvelopeCodec::new(PROTOCOL_VERSION));
        loop {
            tokio::select! {
                Some(envelope) = rx.recv() => {
                    let payload = match encode_response(&envelope) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(error = %err, "cannot serialize response");
                            continue;
                        }
                    };
                    if framed.send(payload).await.is_err() {
                        break;
                    }
                }
                frame = framed.next() => {
                    match frame {
                        None => break,
                        Some(Err(err)) => {
                            // A wrong version byte keeps the connection:
                            // answer and let the client recover.
                            let mismatch = err
                                .get_ref()
                                .map(|inner| {
                                    inner
                                        .downcast_ref::<crate::protocol::VersionMismatch>()
                                        .is_some()
                                })
                                .unwrap_or(false);
                            if mismatch {
                                let resp = ResponseEnvelope {
                                    req_id: 0,
                                    body: Response::error(
                                        libc::EPROTONOSUPPORT,
                                        "unsupported protocol version",
                                    ),
                                };
                                let _ = tx.send(resp);
                                continue;
                            }
                            debug!(client, error = %err, "client framing error");
                            break;
                        }
                        Some(Ok(payload)) => self.route_frame(client, &payload, &tx),
                    }
                }
                else => break,
            }
        }

        self.disconnect(client);
    }

    /// Decodes one frame and hands it to the right family queue.
    fn route_frame(
        &self,
        client: ClientId,
        payload: &[u8],
        tx: &mpsc::UnboundedSender<ResponseEnvelope>,
    ) {
        let envelope = match decode_request(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                let _ = tx.send(ResponseEnvelope {
                    req_id: 0,
                    body: Response::error(err.code(), err.message()),
                });
                return;
            }
        };
        let req_id = envelope.req_id;

        // Ping needs no scheduler.
        if matches!(envelope.body, Request::Ping) {
            let _ = tx.send(ResponseEnvelope {
                req_id,
                body: Response::Ping,
            });
            return;
        }

        let Some(family) = request_family(&envelope.body) else {
            let _ = tx.send(ResponseEnvelope {
                req_id,
                body: Response::error(libc::EINVAL, "request names no resource family"),
            });
            return;
        };
        let Some(queue) = self.queues.get(&family) else {
            let _ = tx.send(ResponseEnvelope {
                req_id,
                body: Response::error(
                    libc::EINVAL,
                    format!("family '{family}' is not managed by this daemon"),
                ),
            });
            return;
        };

        let reqc = ReqContainer::new(client, envelope);
        if let Some(slot) = self.clients.lock().get_mut(&client) {
            slot.outstanding.retain(|w| w.strong_count() > 0);
            slot.outstanding.push(Arc::downgrade(&reqc));
        }
        queue.push(reqc);
    }

    /// Forwards queued responses to their clients. Responses for
    /// disconnected clients are dropped.
    pub async fn pump_responses(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            while let Some(resp) = self.responses.try_pop() {
                let mut clients = self.clients.lock();
                if let Some(slot) = clients.get_mut(&resp.client) {
                    slot.outstanding.retain(|w| w.strong_count() > 0);
                    if slot.sender.send(resp.envelope).is_err() {
                        debug!(client = resp.client, "dropping response for gone client");
                    }
                }
            }
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    // Flush what the schedulers queued during shutdown.
                    while let Some(resp) = self.responses.try_pop() {
                        let clients = self.clients.lock();
                        if let Some(slot) = clients.get(&resp.client) {
                            let _ = slot.sender.send(resp.envelope);
                        }
                    }
                    break;
                }
                _ = self.responses.notified() => {}
            }
        }
    }

    /// Cancels the outstanding requests of a vanished client.
    fn disconnect(&self, client: ClientId) {
        let Some(slot) = self.clients.lock().remove(&client) else {
            return;
        };
        let mut cancelled = 0;
        for weak in slot.outstanding {
            if let Some(reqc) = weak.upgrade() {
                reqc.set_rc(-libc::ECANCELED);
                cancelled += 1;
            }
        }
        debug!(client, cancelled, "client disconnected");
    }
}

/// The family a request belongs to, driving queue selection.
fn request_family(request: &Request) -> Option<Family> {
    match request {
        Request::Ping => None,
        Request::ReadAlloc { media, .. } => media.first().map(|m| m.family),
        Request::WriteAlloc { family, .. } => Some(*family),
        Request::Release { media } => media.first().map(|m| m.id.family),
        Request::Format { medium, .. } => Some(medium.family),
        Request::Notify { family, .. } => Some(*family),
    }
}
