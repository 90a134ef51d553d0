//! Request containers, sub-requests and response containers.
//!
//! A request container is shared between the scheduler and every device
//! worker serving one of its media. Its mutable state (the first error,
//! per-medium statuses, reserved media) sits behind one internal mutex;
//! the last worker to observe completion publishes the response. The lock
//! is never held across an await point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::CodedError;
use crate::protocol::{
    AllocatedMedium, Request, RequestEnvelope, Response, ResponseEnvelope,
};
use crate::queue::TsQueue;
use crate::types::{FsType, MediumId, MediumInfo};

/// Identifies the client connection a response must travel back on.
pub type ClientId = u64;

/// Dispatch class of a request, the unit of fair-share accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqClass {
    Format,
    Write,
    Read,
}

impl ReqClass {
    /// Index into (format, write, read) triples.
    pub fn index(&self) -> usize {
        match self {
            Self::Format => 0,
            Self::Write => 1,
            Self::Read => 2,
        }
    }
}

/// Progress of one sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubStatus {
    Todo,
    Done,
    Error,
    Cancel,
}

impl SubStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Todo)
    }
}

/// Per-medium slot of an allocation.
#[derive(Debug)]
pub struct AllocSlot {
    pub status: SubStatus,
    /// Medium reserved for this slot, still DSS-locked by the scheduler.
    /// Taken by the device worker when the load starts.
    pub medium: Option<MediumInfo>,
    /// Filled on success.
    pub result: Option<AllocatedMedium>,
    /// Device that completed the sub-request; None until then.
    pub served_by: Option<String>,
    /// A device currently holds the sub-request for this slot.
    pub submitted: bool,
}

impl AllocSlot {
    pub fn new(medium: Option<MediumInfo>) -> Self {
        Self {
            status: SubStatus::Todo,
            medium,
            result: None,
            served_by: None,
            submitted: false,
        }
    }
}

/// Allocation parameters: read and write differ only in candidate
/// handling.
#[derive(Debug)]
pub struct AllocParams {
    pub class: ReqClass,
    pub slots: Vec<AllocSlot>,
    /// Read allocations: candidate media beyond the placed ones, in
    /// client preference order.
    pub spare_candidates: Vec<MediumId>,
}

/// Per-medium state of a release.
#[derive(Debug, Clone)]
pub struct TosyncMedium {
    pub status: SubStatus,
    pub medium: MediumId,
    pub written_size: u64,
    pub nb_obj: u64,
    /// Client-observed I/O status; non-zero poisons the device's batch.
    pub client_rc: i32,
}

/// Release parameters. Only media with `to_sync` reach this list.
#[derive(Debug)]
pub struct ReleaseParams {
    pub media: Vec<TosyncMedium>,
}

impl ReleaseParams {
    /// Whether every tosync medium reached a terminal status.
    pub fn is_ended(&self) -> bool {
        self.media.iter().all(|m| m.status.is_terminal())
    }
}

/// Format parameters.
#[derive(Debug)]
pub struct FormatParams {
    /// Resolved medium, still DSS-locked by the scheduler. Taken by the
    /// device worker once transferred into the drive.
    pub medium: Option<MediumInfo>,
    pub fs: FsType,
    pub unlock: bool,
}

/// Kind-specific mutable state of a request.
#[derive(Debug)]
pub enum ReqParams {
    /// Ping and notify need no per-medium state.
    Simple,
    Alloc(AllocParams),
    Release(ReleaseParams),
    Format(FormatParams),
}

/// Guarded state of a request container.
#[derive(Debug)]
pub struct ReqState {
    /// First error wins; sticky.
    pub rc: i32,
    pub params: ReqParams,
    /// Whether a (final) response was already queued for this request.
    pub responded: bool,
}

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// One client request, shared by its sub-requests until retired.
#[derive(Debug)]
pub struct ReqContainer {
    /// Daemon-local identity, distinct from the client's req_id.
    pub local_id: u64,
    pub client: ClientId,
    pub req_id: u64,
    pub body: Request,
    pub received_at: Instant,
    state: Mutex<ReqState>,
}

impl ReqContainer {
    pub fn new(client: ClientId, envelope: RequestEnvelope) -> Arc<Self> {
        let params = match &envelope.body {
            Request::ReadAlloc { .. } | Request::WriteAlloc { .. } => {
                // Slots are filled at dispatch time, once media are
                // resolved and locked.
                ReqParams::Simple
            }
            Request::Release { media } => ReqParams::Release(ReleaseParams {
                media: media
                    .iter()
                    .filter(|m| m.to_sync)
                    .map(|m| TosyncMedium {
                        status: SubStatus::Todo,
                        medium: m.id.clone(),
                        written_size: m.size_written,
                        nb_obj: m.nb_obj,
                        client_rc: m.rc,
                    })
                    .collect(),
            }),
            Request::Format { fs, unlock, .. } => ReqParams::Format(FormatParams {
                medium: None,
                fs: *fs,
                unlock: *unlock,
            }),
            _ => ReqParams::Simple,
        };
        Arc::new(Self {
            local_id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            client,
            req_id: envelope.req_id,
            body: envelope.body,
            received_at: Instant::now(),
            state: Mutex::new(ReqState {
                rc: 0,
                params,
                responded: false,
            }),
        })
    }

    /// Runs `f` under the container mutex.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ReqState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// The sticky error of this request, 0 when none.
    pub fn rc(&self) -> i32 {
        self.state.lock().rc
    }

    /// Records the first error. Returns true when this call set it.
    pub fn set_rc(&self, rc: i32) -> bool {
        let mut state = self.state.lock();
        if state.rc == 0 && rc != 0 {
            state.rc = rc.abs();
            true
        } else {
            false
        }
    }

    pub fn class(&self) -> Option<ReqClass> {
        match &self.body {
            Request::ReadAlloc { .. } => Some(ReqClass::Read),
            Request::WriteAlloc { .. } => Some(ReqClass::Write),
            Request::Format { .. } => Some(ReqClass::Format),
            _ => None,
        }
    }
}

/// The portion of an allocation targeting one medium on one drive.
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub reqc: Arc<ReqContainer>,
    pub medium_index: usize,
    /// Sticky: an error on this sub-request was caused by the medium.
    pub failure_on_medium: bool,
}

impl SubRequest {
    pub fn new(reqc: Arc<ReqContainer>, medium_index: usize) -> Self {
        Self {
            reqc,
            medium_index,
            failure_on_medium: false,
        }
    }
}

/// A one-shot response on its way back to a client.
#[derive(Debug, Clone)]
pub struct RespContainer {
    pub client: ClientId,
    pub envelope: ResponseEnvelope,
}

/// Queues an error response for a request, once.
///
/// Subsequent calls for the same container are no-ops: the first error
/// response retires the request from the client's point of view.
pub fn queue_error_response(
    responses: &TsQueue<RespContainer>,
    error: &CodedError,
    reqc: &ReqContainer,
) {
    let already = reqc.with_state(|state| {
        let was = state.responded;
        state.responded = true;
        was
    });
    if already {
        return;
    }
    responses.push(RespContainer {
        client: reqc.client,
        envelope: ResponseEnvelope {
            req_id: reqc.req_id,
            body: Response::error(error.code(), error.message()),
        },
    });
}

/// Queues a success response for a request.
pub fn queue_response(responses: &TsQueue<RespContainer>, reqc: &ReqContainer, body: Response) {
    let already = reqc.with_state(|state| {
        let was = state.responded;
        state.responded = true;
        was
    });
    if already {
        return;
    }
    responses.push(RespContainer {
        client: reqc.client,
        envelope: ResponseEnvelope {
            req_id: reqc.req_id,
            body,
        },
    });
}

/// Builds the release response enumerating every synced medium.
pub fn release_response_body(params: &ReleaseParams) -> Response {
    Response::Release {
        media: params.media.iter().map(|m| m.medium.clone()).collect(),
    }
}
