//! Per-drive state owned by the device worker.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CodedError, OpResult};
use crate::sched::request::{ReqClass, SubRequest};
use crate::types::{AdmStatus, DeviceInfo, Family, MediumId, MediumInfo, OpStatus};
use crate::worker::WorkerHandle;

use super::sync::{SyncBatch, SyncEntry};

/// Mutable state of one drive, guarded by the device mutex.
#[derive(Debug)]
pub struct DeviceState {
    /// DSS row of the device; `adm_status` is the operator's view.
    pub info: DeviceInfo,
    pub op_status: OpStatus,
    /// The medium in the drive. A device exclusively owns its loaded
    /// medium.
    pub loaded_medium: Option<MediumInfo>,
    pub mnt_path: Option<PathBuf>,
    /// Work published by the scheduler, at most one at a time.
    pub sub_request: Option<SubRequest>,
    /// Dispatch class currently occupying this drive, for fair-share
    /// accounting.
    pub current_class: Option<ReqClass>,
    /// Client I/O is in flight between allocation and release.
    pub ongoing_io: bool,
    /// Dispatch reserved this device within the current tick.
    pub ongoing_scheduled: bool,
    pub needs_sync: bool,
    /// Last non-zero client rc seen on release; forces an error drain.
    pub last_client_rc: i32,
    pub sync_batch: SyncBatch,
}

/// One drive and its worker lifecycle handle.
#[derive(Debug)]
pub struct Device {
    pub serial: String,
    pub family: Family,
    pub path: PathBuf,
    /// Tape generation (e.g. `LTO5`) derived from the drive model;
    /// None for families without technologies.
    pub technology: Option<String>,
    state: Mutex<DeviceState>,
    pub thread: WorkerHandle,
}

/// Copy of the dispatch-relevant device state, taken under the mutex.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub serial: String,
    pub technology: Option<String>,
    pub op_status: OpStatus,
    pub loaded_medium: Option<MediumId>,
    pub current_class: Option<ReqClass>,
    pub sched_ready: bool,
    pub online: bool,
}

impl Device {
    pub fn new(info: DeviceInfo, technology: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            serial: info.id.clone(),
            family: info.family,
            path: info.path.clone(),
            technology,
            state: Mutex::new(DeviceState {
                info,
                op_status: OpStatus::Empty,
                loaded_medium: None,
                mnt_path: None,
                sub_request: None,
                current_class: None,
                ongoing_io: false,
                ongoing_scheduled: false,
                needs_sync: false,
                last_client_rc: 0,
                sync_batch: SyncBatch::new(),
            }),
            thread: WorkerHandle::new(),
        })
    }

    /// Runs `f` under the device mutex. Callers must not await inside.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Whether the worker may receive new sub-requests from dispatch.
    ///
    /// `current_class` also gates readiness: the slot is empty while the
    /// worker executes its sub-request, but the drive is not free.
    pub fn is_sched_ready(&self) -> bool {
        if !self.thread.is_running() {
            return false;
        }
        self.with_state(|state| {
            !state.ongoing_io
                && !state.needs_sync
                && state.sub_request.is_none()
                && state.current_class.is_none()
                && !state.ongoing_scheduled
                && state.op_status != OpStatus::Failed
                && state.info.adm_status == AdmStatus::Unlocked
        })
    }

    /// Whether the device participates in scheduling at all.
    pub fn is_online(&self) -> bool {
        self.thread.is_running()
            && self.with_state(|state| state.info.adm_status == AdmStatus::Unlocked)
    }

    /// Whether nothing is pending on this device.
    pub fn is_idle(&self) -> bool {
        self.with_state(|state| {
            !state.ongoing_io && state.sub_request.is_none() && state.sync_batch.is_empty()
        })
    }

    /// Whether the worker can still take release entries.
    pub fn is_release_ready(&self) -> bool {
        !self.thread.is_stopped()
    }

    /// Atomically stores a pending sub-request and signals the worker.
    ///
    /// Fails with EAGAIN when the worker is stopping and EBUSY when a
    /// sub-request is already pending.
    pub fn submit(&self, sub: SubRequest, class: ReqClass) -> OpResult<()> {
        if !self.thread.is_running() {
            return Err(CodedError::new(
                libc::EAGAIN,
                format!("device '{}' is stopping", self.serial),
            ));
        }
        self.with_state(|state| {
            if state.sub_request.is_some() {
                return Err(CodedError::busy(format!(
                    "device '{}' already holds a pending sub-request",
                    self.serial
                )));
            }
            state.sub_request = Some(sub);
            state.current_class = Some(class);
            state.ongoing_scheduled = false;
            Ok(())
        })?;
        self.thread.signal();
        Ok(())
    }

    /// Appends a release intent to the pending sync batch and signals the
    /// worker. The client is done with its I/O, so the drive becomes
    /// schedulable again; the flush itself is deferred to the batcher.
    pub fn submit_sync(&self, entry: SyncEntry) {
        self.with_state(|state| {
            if entry.client_rc != 0 {
                state.last_client_rc = entry.client_rc;
            }
            state.sync_batch.push(entry);
            state.ongoing_io = false;
            state.current_class = None;
        });
        self.thread.signal();
    }

    /// Takes a dispatch-reservation on this device for the current tick.
    pub fn reserve_for_dispatch(&self) -> bool {
        self.with_state(|state| {
            if state.ongoing_scheduled {
                false
            } else {
                state.ongoing_scheduled = true;
                true
            }
        })
    }

    pub fn release_dispatch_reservation(&self) {
        self.with_state(|state| state.ongoing_scheduled = false);
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let running = self.thread.is_running();
        self.with_state(|state| DeviceSnapshot {
            serial: self.serial.clone(),
            technology: self.technology.clone(),
            op_status: state.op_status,
            loaded_medium: state.loaded_medium.as_ref().map(|m| m.id.clone()),
            current_class: state.current_class,
            sched_ready: running
                && !state.ongoing_io
                && !state.needs_sync
                && state.sub_request.is_none()
                && state.current_class.is_none()
                && !state.ongoing_scheduled
                && state.op_status != OpStatus::Failed
                && state.info.adm_status == AdmStatus::Unlocked,
            online: running && state.info.adm_status == AdmStatus::Unlocked,
        })
    }
}
