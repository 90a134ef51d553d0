//! The device worker: cooperative main loop, request handling and the
//! end-of-life sequence.
//!
//! The worker is the only task performing library, filesystem and DSS
//! side-effects on its drive. Each loop iteration discards cancelled
//! work, reevaluates the sync batch, flushes when due, serves the pending
//! sub-request, then parks until signalled or until the batch deadline.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::CodedError;
use crate::protocol::{AllocatedMedium, Request, Response};
use crate::sched::request::{
    queue_error_response, queue_response, release_response_body, ReqParams, SubRequest, SubStatus,
};
use crate::time::compute_wakeup;
use crate::types::{AdmStatus, MediumInfo, OpStatus};

use super::env::DeviceEnv;
use super::ops::{
    dev_empty, dev_format, dev_load, dev_mount, dev_umount, fail_release_medium,
    media_update_after_sync, release_device_lock, release_medium_lock,
};
use super::state::Device;

/// One drive's worker task.
pub struct DeviceWorker {
    dev: Arc<Device>,
    env: Arc<DeviceEnv>,
}

impl DeviceWorker {
    pub fn new(dev: Arc<Device>, env: Arc<DeviceEnv>) -> Self {
        Self { dev, env }
    }

    pub fn spawn(dev: Arc<Device>, env: Arc<DeviceEnv>) -> JoinHandle<()> {
        tokio::spawn(Self::new(dev, env).run())
    }

    /// Main loop. Runs until the worker is told to stop and has drained
    /// its pending work, or until a fatal error.
    pub async fn run(self) {
        let dev = &self.dev;
        let env = &self.env;
        debug!(device = %dev.serial, "device worker started");

        loop {
            self.discard_cancelled_sub().await;

            let ended = dev.with_state(|state| state.sync_batch.scrub_cancelled());
            for reqc in ended {
                let err = CodedError::new(reqc.rc(), "release aborted by an earlier error");
                queue_error_response(&env.responses, &err, &reqc);
            }

            let daemon_running = env.daemon_running.load(Ordering::Acquire);
            dev.with_state(|state| {
                if !state.needs_sync {
                    state.needs_sync = state.sync_batch.needs_sync(
                        &env.sync,
                        dev.thread.is_stopping(),
                        !daemon_running,
                        state.last_client_rc,
                    );
                }
            });

            let (ongoing_io, has_sub, batch_empty, needs_sync) = dev.with_state(|state| {
                (
                    state.ongoing_io,
                    state.sub_request.is_some(),
                    state.sync_batch.is_empty(),
                    state.needs_sync,
                )
            });

            if dev.thread.is_stopping() && !ongoing_io && !has_sub && batch_empty {
                debug!(device = %dev.serial, "switching to stopped");
                break;
            }

            if !ongoing_io {
                if needs_sync {
                    if let Err(err) = self.dev_sync().await {
                        error!(
                            device = %dev.serial, error = %err,
                            "fatal error syncing device"
                        );
                        dev.thread.set_status(err.code());
                        break;
                    }
                }
                let pending = dev.with_state(|state| {
                    state
                        .sub_request
                        .as_ref()
                        .map(|sub| matches!(sub.reqc.body, Request::Format { .. }))
                });
                if let Some(is_format) = pending {
                    let outcome = if is_format {
                        self.handle_format().await
                    } else {
                        self.handle_read_write().await
                    };
                    if let Err(err) = outcome {
                        error!(
                            device = %dev.serial, error = %err,
                            "fatal error handling sub-request"
                        );
                        dev.thread.set_status(err.code());
                        break;
                    }
                }
            }

            if !dev.thread.is_stopped() {
                let oldest = dev.with_state(|state| state.sync_batch.oldest());
                let deadline = compute_wakeup(Instant::now(), oldest, env.sync.time);
                dev.thread.wait_until(deadline).await;
            }
        }

        self.end().await;
        self.dev.thread.mark_stopped();
        debug!(
            device = %self.dev.serial,
            status = self.dev.thread.status(),
            "device worker stopped"
        );
    }

    /// Drops a pending allocation sub-request whose parent already failed
    /// on another device.
    async fn discard_cancelled_sub(&self) {
        let cancelled = self.dev.with_state(|state| {
            let discard = match &state.sub_request {
                Some(sub) => {
                    !matches!(sub.reqc.body, Request::Format { .. }) && sub.reqc.rc() != 0
                }
                None => false,
            };
            if discard {
                state.current_class = None;
                state.sub_request.take()
            } else {
                None
            }
        });
        if let Some(sub) = cancelled {
            let freed = cancel_alloc_slot(&sub);
            for medium in freed {
                if let Err(err) = release_medium_lock(&self.env, &medium).await {
                    warn!(error = %err, "cannot release lock of cancelled medium");
                }
            }
        }
    }

    /// Flushes the medium, updates the DSS statistics, then drains the
    /// batch. Any error here is fatal for the worker.
    async fn dev_sync(&self) -> Result<(), CodedError> {
        let dev = &self.dev;
        let env = &self.env;
        let (medium, mnt, last_rc, bytes, nb_obj) = dev.with_state(|state| {
            (
                state.loaded_medium.clone(),
                state.mnt_path.clone(),
                state.last_client_rc,
                state.sync_batch.total_bytes(),
                state.sync_batch.total_objects(),
            )
        });

        let (Some(mut medium), Some(mnt)) = (medium, mnt) else {
            // No mounted medium: nothing to flush. Releases referencing a
            // gone medium are answered with the pending client error.
            dev.with_state(|state| {
                state.last_client_rc = 0;
                state.needs_sync = false;
            });
            drain_batch(dev, env, last_rc.abs()).await;
            return Ok(());
        };

        // Do not sync on a client-reported error: we do not know what
        // landed on the medium.
        let sync_rc = if last_rc == 0 {
            let sync_result = match env.fs(medium.fs.kind) {
                Ok(fsa) => fsa.sync_medium(&mnt).await,
                Err(err) => Err(err),
            };
            match sync_result {
                Ok(()) => {
                    debug!(medium = %medium.id, "sync done");
                    0
                }
                Err(err) => {
                    error!(medium = %medium.id, error = %err, "cannot flush medium");
                    err.code()
                }
            }
        } else {
            last_rc.abs()
        };

        let update_result =
            media_update_after_sync(env, &mut medium, bytes, sync_rc, &mnt, nb_obj).await;

        dev.with_state(|state| {
            state.loaded_medium = Some(medium);
            state.last_client_rc = 0;
            state.needs_sync = false;
            state.ongoing_io = false;
        });

        let final_rc = if sync_rc != 0 {
            sync_rc
        } else {
            update_result.as_ref().err().map(|e| e.code()).unwrap_or(0)
        };
        drain_batch(dev, env, final_rc).await;

        if final_rc != 0 {
            Err(CodedError::new(final_rc, "medium sync failed"))
        } else {
            Ok(())
        }
    }

    /// Serves a format sub-request, per §format of the drive lifecycle:
    /// reuse the loaded medium when it matches, otherwise empty and load,
    /// then format and answer.
    async fn handle_format(&self) -> Result<(), CodedError> {
        let dev = &self.dev;
        let env = &self.env;
        let sub = dev
            .with_state(|state| state.sub_request.take())
            .expect("format handler invoked without a sub-request");
        let reqc = Arc::clone(&sub.reqc);

        let Request::Format { medium: target_id, fs, unlock } = reqc.body.clone() else {
            return Err(CodedError::invalid("format handler got a non-format request"));
        };
        let mut medium_to_format = reqc.with_state(|state| match &mut state.params {
            ReqParams::Format(params) => params.medium.take(),
            _ => None,
        });

        let already_loaded = dev.with_state(|state| {
            state.op_status == OpStatus::Loaded
                && state
                    .loaded_medium
                    .as_ref()
                    .map(|m| m.id == target_id)
                    .unwrap_or(false)
        });

        if already_loaded {
            info!(
                medium = %target_id, device = %dev.serial,
                "medium to format is already loaded"
            );
        } else {
            if let Err(op) = dev_empty(dev, env).await {
                // Requeue the whole request so another drive picks it up;
                // this drive is done for.
                error!(
                    device = %dev.serial, error = %op.error,
                    "cannot empty device to format, requeueing the request"
                );
                reqc.with_state(|state| {
                    if let ReqParams::Format(params) = &mut state.params {
                        params.medium = medium_to_format.take();
                    }
                });
                env.ongoing_formats.lock().remove(&target_id);
                dev.with_state(|state| state.current_class = None);
                env.incoming.push(reqc);
                return Err(op.error);
            }

            match dev_load(dev, env, &mut medium_to_format, true).await {
                Err(op) if op.can_retry => {
                    // Busy library: keep the sub-request pending and try
                    // again on the next wakeup.
                    warn!(
                        medium = %target_id,
                        "medium to format is busy, trying again later"
                    );
                    reqc.with_state(|state| {
                        if let ReqParams::Format(params) = &mut state.params {
                            params.medium = medium_to_format.take();
                        }
                    });
                    dev.with_state(|state| state.sub_request = Some(sub));
                    return Ok(());
                }
                Err(op) => {
                    queue_error_response(&env.responses, &op.error, &reqc);
                    env.ongoing_formats.lock().remove(&target_id);
                    dev.with_state(|state| state.current_class = None);
                    if op.failure_on_dev {
                        error!(
                            device = %dev.serial, error = %op.error,
                            "device error while loading medium to format"
                        );
                        return Err(op.error);
                    }
                    error!(
                        medium = %target_id, error = %op.error,
                        "medium error while loading to format"
                    );
                    return Ok(());
                }
                Ok(()) => {}
            }
        }

        let result = dev_format(dev, env, fs, unlock).await;
        env.ongoing_formats.lock().remove(&target_id);
        dev.with_state(|state| state.current_class = None);
        match result {
            Ok(()) => {
                queue_response(
                    &env.responses,
                    &reqc,
                    Response::Format {
                        medium: target_id,
                    },
                );
                Ok(())
            }
            Err(err) => {
                queue_error_response(&env.responses, &err, &reqc);
                Err(err)
            }
        }
    }

    /// Serves a read/write allocation sub-request.
    async fn handle_read_write(&self) -> Result<(), CodedError> {
        let dev = &self.dev;
        let env = &self.env;
        let mut sub = dev
            .with_state(|state| state.sub_request.take())
            .expect("read/write handler invoked without a sub-request");

        // A sibling may have failed while this sub-request waited.
        if sub.reqc.rc() != 0 {
            let freed = cancel_alloc_slot(&sub);
            dev.with_state(|state| state.current_class = None);
            for medium in freed {
                if let Err(err) = release_medium_lock(env, &medium).await {
                    warn!(error = %err, "cannot release lock of cancelled medium");
                }
            }
            return Ok(());
        }

        let is_write = matches!(sub.reqc.body, Request::WriteAlloc { .. });
        let mut medium = sub.reqc.with_state(|state| match &mut state.params {
            ReqParams::Alloc(alloc) => alloc.slots[sub.medium_index].medium.take(),
            _ => None,
        });

        let mut failure_on_device = false;
        let mut io_ended = false;
        let mut op_err: Option<CodedError> = None;

        // The medium placement pipeline: reuse a mounted medium, mount a
        // loaded one, otherwise empty the drive and load the target.
        'pipeline: {
            if medium.is_none() {
                match dev.with_state(|state| state.op_status) {
                    OpStatus::Mounted => break 'pipeline,
                    OpStatus::Loaded => {}
                    _ => {
                        sub.failure_on_medium = true;
                        io_ended = true;
                        op_err = Some(CodedError::invalid(format!(
                            "empty device '{}' received an allocation without medium",
                            dev.serial
                        )));
                        break 'pipeline;
                    }
                }
            } else {
                if let Err(op) = dev_empty(dev, env).await {
                    error!(
                        device = %dev.serial, error = %op.error,
                        "cannot empty device for allocation"
                    );
                    failure_on_device = true;
                    io_ended = true;
                    op_err = Some(op.error);
                    break 'pipeline;
                }

                // The medium lock travels with the sub-request: on a
                // device-only failure the request retries on another
                // drive with the medium still locked.
                match dev_load(dev, env, &mut medium, false).await {
                    Err(op) if op.can_retry => {
                        warn!(
                            device = %dev.serial,
                            "medium busy in another drive, trying again later"
                        );
                        sub.reqc.with_state(|state| {
                            if let ReqParams::Alloc(alloc) = &mut state.params {
                                alloc.slots[sub.medium_index].medium = medium.take();
                            }
                        });
                        dev.with_state(|state| state.sub_request = Some(sub));
                        return Ok(());
                    }
                    Err(op) => {
                        failure_on_device |= op.failure_on_dev;
                        sub.failure_on_medium |= op.failure_on_medium;
                        io_ended = true;
                        op_err = Some(op.error);
                        break 'pipeline;
                    }
                    Ok(()) => {}
                }
            }

            if dev.with_state(|state| state.op_status) == OpStatus::Loaded {
                if let Err(err) = dev_mount(dev, env).await {
                    error!(
                        device = %dev.serial, error = %err,
                        "cannot mount medium, will try another if possible"
                    );
                    failure_on_device = true;
                    sub.failure_on_medium = true;
                    io_ended = true;
                    dev.with_state(|state| state.op_status = OpStatus::Failed);
                    // Fail the medium early so dispatch cannot reuse it.
                    if let Some(m) = dev.with_state(|state| state.loaded_medium.take()) {
                        fail_release_medium(env, &m).await;
                    }
                    op_err = Some(err);
                    break 'pipeline;
                }
            }

            // LTFS can cunningly mount almost-full tapes read-only, and
            // so would damaged disks. Mark the medium full and let
            // dispatch find another one.
            if is_write {
                let (mnt, fs_kind) = dev.with_state(|state| {
                    (
                        state.mnt_path.clone().expect("mounted without mnt path"),
                        state
                            .loaded_medium
                            .as_ref()
                            .expect("mounted without medium")
                            .fs
                            .kind,
                    )
                });
                let writable = match env.fs(fs_kind) {
                    Ok(fsa) => match fsa.df(&mnt).await {
                        Ok(space) => !space.read_only,
                        Err(_) => false,
                    },
                    Err(_) => false,
                };
                if !writable {
                    let full = dev.with_state(|state| {
                        let m = state.loaded_medium.as_mut().expect("mounted without medium");
                        m.fs.status = crate::types::FsStatus::Full;
                        m.clone()
                    });
                    warn!(
                        medium = %full.id,
                        "medium mounted read-only, marking full and retrying"
                    );
                    sub.failure_on_medium = true;
                    io_ended = true;
                    op_err = Some(CodedError::no_space("medium mounted read-only"));
                    if let Err(err) = env.dss.update_medium(&full).await {
                        error!(
                            medium = %full.id, error = %err,
                            "cannot record FULL status"
                        );
                        failure_on_device = true;
                        op_err = Some(err);
                    }
                }
            }
        }

        self.finish_alloc(sub, op_err, medium, io_ended, failure_on_device)
            .await
    }

    /// Publishes the outcome of an allocation sub-request: fill the
    /// response slot, requeue for retry, or fail the whole request. The
    /// last sub-request to resolve emits the aggregated response.
    async fn finish_alloc(
        &self,
        mut sub: SubRequest,
        op_err: Option<CodedError>,
        mut medium_back: Option<MediumInfo>,
        io_ended: bool,
        failure_on_device: bool,
    ) -> Result<(), CodedError> {
        let dev = &self.dev;
        let env = &self.env;

        // Gathered outside the request mutex to keep lock ordering
        // one-way (device then request).
        let fill = dev.with_state(|state| {
            state.loaded_medium.as_ref().map(|m| AllocatedMedium {
                id: m.id.clone(),
                fs: m.fs.kind,
                addr: m.addr_type,
                root_path: state
                    .mnt_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                avail: matches!(sub.reqc.body, Request::WriteAlloc { .. })
                    .then(|| m.stats.phys_spc_free),
            })
        });

        let mut requeued = false;
        let mut cancelled = false;
        let mut response: Option<Response> = None;
        let mut error_response: Option<CodedError> = None;
        let mut media_to_unlock: Vec<MediumInfo> = Vec::new();
        let mut peers_to_release: Vec<String> = Vec::new();

        let fatal_err = op_err.clone();
        sub.reqc.with_state(|state| {
            let is_write = matches!(sub.reqc.body, Request::WriteAlloc { .. });
            let ReqParams::Alloc(alloc) = &mut state.params else {
                return;
            };
            if state.rc != 0 {
                // A sibling failed while this worker was busy.
                let slot = &mut alloc.slots[sub.medium_index];
                slot.status = SubStatus::Cancel;
                if let Some(m) = slot.medium.take() {
                    media_to_unlock.push(m);
                }
                if let Some(m) = medium_back.take() {
                    media_to_unlock.push(m);
                }
                cancelled = true;
                return;
            }
            match &op_err {
                None => {
                    let slot = &mut alloc.slots[sub.medium_index];
                    slot.status = SubStatus::Done;
                    slot.result = fill.clone();
                    slot.served_by = Some(dev.serial.clone());
                    if alloc.slots.iter().all(|s| s.status.is_terminal()) {
                        let media: Vec<AllocatedMedium> = alloc
                            .slots
                            .iter()
                            .filter_map(|s| s.result.clone())
                            .collect();
                        response = Some(if is_write {
                            Response::WriteAlloc { media }
                        } else {
                            Response::ReadAlloc { media }
                        });
                    }
                }
                Some(err) => {
                    let can_requeue = is_write
                        || !sub.failure_on_medium
                        || !alloc.spare_candidates.is_empty();
                    if can_requeue {
                        requeued = true;
                        if !sub.failure_on_medium {
                            // Keep the locked medium with the request for
                            // another drive.
                            alloc.slots[sub.medium_index].medium = medium_back.take();
                        }
                    } else {
                        // First fatal error: poison the request and
                        // cancel completed siblings.
                        state.rc = err.code();
                        alloc.slots[sub.medium_index].status = SubStatus::Error;
                        error_response = Some(err.clone());
                        for slot in &mut alloc.slots {
                            if slot.status == SubStatus::Done {
                                slot.status = SubStatus::Cancel;
                                if let Some(serial) = slot.served_by.take() {
                                    peers_to_release.push(serial);
                                }
                            }
                        }
                    }
                }
            }
        });

        for m in media_to_unlock {
            if let Err(err) = release_medium_lock(env, &m).await {
                warn!(error = %err, "cannot release lock of cancelled medium");
            }
        }

        if requeued {
            debug!(device = %dev.serial, "requeueing failed sub-request");
            dev.with_state(|state| state.current_class = None);
            env.retry_queue.push(sub);
        } else if let Some(err) = error_response {
            queue_error_response(&env.responses, &err, &sub.reqc);
            dev.with_state(|state| state.current_class = None);
            // Completed siblings hold mounted media for a request that
            // just died; free their drives.
            let registry = env.registry.read();
            for serial in peers_to_release {
                if let Some(peer) = registry.get(&serial) {
                    peer.with_state(|state| {
                        state.ongoing_io = false;
                        state.current_class = None;
                    });
                    peer.thread.signal();
                }
            }
        } else if let Some(resp) = response {
            queue_response(&env.responses, &sub.reqc, resp);
        }

        if cancelled || io_ended {
            dev.with_state(|state| state.current_class = None);
        } else if !requeued && op_err.is_none() {
            // Client I/O starts now; the drive stays busy until release.
            dev.with_state(|state| state.ongoing_io = true);
        }

        if failure_on_device {
            Err(fatal_err.unwrap_or_else(|| CodedError::io("device failure")))
        } else {
            Ok(())
        }
    }

    /// End-of-life: settle the pending sub-request, unmount, release
    /// locks, and record a FAILED device when stopping on error.
    async fn end(&self) {
        let dev = &self.dev;
        if dev.thread.is_running() {
            dev.thread.signal_stop(0);
        }

        self.cancel_pending_sub().await;
        self.end_mounted_medium().await;
        self.end_loaded_medium().await;
        self.end_device().await;
        dev.with_state(|state| {
            state.ongoing_io = false;
            state.current_class = None;
        });
    }

    /// Settles a sub-request still pending at worker end.
    async fn cancel_pending_sub(&self) {
        let dev = &self.dev;
        let env = &self.env;
        let Some(sub) = dev.with_state(|state| state.sub_request.take()) else {
            return;
        };
        let reqc = Arc::clone(&sub.reqc);

        let format_target = match &reqc.body {
            Request::Format { medium, .. } => Some(medium.clone()),
            _ => None,
        };
        if let Some(target_id) = format_target {
            let status = dev.thread.status();
            let medium = reqc.with_state(|state| match &mut state.params {
                ReqParams::Format(params) => params.medium.take(),
                _ => None,
            });
            env.ongoing_formats.lock().remove(&target_id);
            match medium {
                None if status != 0 => {
                    // The medium was already transferred to this device;
                    // the failure is terminal for the request.
                    let err = CodedError::new(status, "device failed while formatting");
                    queue_error_response(&env.responses, &err, &reqc);
                }
                Some(medium) => {
                    // Give the medium back and let the scheduler place
                    // the format on another drive.
                    if let Err(err) = release_medium_lock(env, &medium).await {
                        error!(
                            medium = %medium.id, error = %err,
                            "cannot release medium of pending format"
                        );
                        queue_error_response(&env.responses, &err, &reqc);
                    } else {
                        env.incoming.push(reqc);
                    }
                }
                None => {
                    env.incoming.push(reqc);
                }
            }
            return;
        }

        // Allocation sub-request: requeue while the daemon lives,
        // cancel during shutdown.
        if env.daemon_running.load(Ordering::Acquire) {
            env.retry_queue.push(sub);
        } else {
            let freed = cancel_alloc_slot(&sub);
            for medium in freed {
                if let Err(err) = release_medium_lock(env, &medium).await {
                    warn!(error = %err, "cannot release lock of cancelled medium");
                }
            }
            let err = CodedError::cancelled("daemon is shutting down");
            reqc.set_rc(-err.code());
            queue_error_response(&env.responses, &err, &reqc);
        }
    }

    /// Unmounts the medium at worker end, or fails it when the worker is
    /// stopping on error.
    async fn end_mounted_medium(&self) {
        let dev = &self.dev;
        let env = &self.env;
        if dev.with_state(|state| state.op_status) != OpStatus::Mounted {
            return;
        }
        if dev.thread.status() == 0 {
            if let Err(op) = dev_umount(dev, env).await {
                error!(
                    device = %dev.serial, error = %op.error,
                    "cannot umount medium at device exit"
                );
                dev.thread.set_status(op.error.code());
            }
        }
        if dev.thread.status() != 0 {
            if let Some(medium) = dev.with_state(|state| state.loaded_medium.take()) {
                fail_release_medium(env, &medium).await;
            }
        }
    }

    /// Leaves the medium loaded but releases its lock, or fails it when
    /// stopping on error.
    async fn end_loaded_medium(&self) {
        let dev = &self.dev;
        let env = &self.env;
        if dev.with_state(|state| state.op_status) != OpStatus::Loaded {
            return;
        }
        if dev.thread.status() == 0 {
            let medium = dev.with_state(|state| state.loaded_medium.take());
            if let Some(medium) = medium {
                if let Err(err) = release_medium_lock(env, &medium).await {
                    error!(
                        medium = %medium.id, error = %err,
                        "cannot release medium lock at device exit"
                    );
                    dev.thread.set_status(err.code());
                    fail_release_medium(env, &medium).await;
                }
            }
        } else if let Some(medium) = dev.with_state(|state| state.loaded_medium.take()) {
            fail_release_medium(env, &medium).await;
        }
    }

    /// Releases the device lock, or records the FAILED administrative
    /// status first when stopping on error.
    async fn end_device(&self) {
        let dev = &self.dev;
        let env = &self.env;
        if dev.thread.status() == 0 {
            if let Err(err) = release_device_lock(env, dev).await {
                error!(
                    device = %dev.serial, error = %err,
                    "cannot release device lock at exit"
                );
                dev.thread.set_status(err.code());
            }
        }
        if dev.thread.status() != 0 {
            drain_batch(dev, env, dev.thread.status()).await;
            dev.with_state(|state| {
                state.op_status = OpStatus::Failed;
                state.info.adm_status = AdmStatus::Failed;
            });
            error!(device = %dev.serial, "setting device to failed");
            match env
                .dss
                .update_device_adm_status(&dev.serial, AdmStatus::Failed)
                .await
            {
                Err(err) => {
                    error!(
                        device = %dev.serial, error = %err,
                        "cannot set device to failed in DSS, keeping its lock"
                    );
                }
                Ok(()) => {
                    if let Err(err) = release_device_lock(env, dev).await {
                        error!(
                            device = %dev.serial, error = %err,
                            "cannot release lock of failed device"
                        );
                    }
                }
            }
        }
    }
}

/// Marks the slot of a cancelled allocation sub-request CANCEL and
/// returns any media whose locks must be released.
fn cancel_alloc_slot(sub: &SubRequest) -> Vec<MediumInfo> {
    let mut freed = Vec::new();
    sub.reqc.with_state(|state| {
        if let ReqParams::Alloc(alloc) = &mut state.params {
            let slot = &mut alloc.slots[sub.medium_index];
            slot.status = SubStatus::Cancel;
            if let Some(m) = slot.medium.take() {
                freed.push(m);
            }
        }
    });
    freed
}

/// Drains the device's sync batch with the flush outcome `rc`,
/// acknowledging or failing each pending release. The last terminal
/// sub-request of a release publishes its response.
pub(super) async fn drain_batch(dev: &Device, env: &DeviceEnv, rc: i32) {
    let entries = dev.with_state(|state| {
        state.needs_sync = false;
        state.sync_batch.drain()
    });
    for entry in entries {
        let reqc = entry.sub.reqc;
        if rc != 0 {
            reqc.set_rc(rc);
        }
        let (ended, parent_rc, body) = reqc.with_state(|state| {
            let ReqParams::Release(release) = &mut state.params else {
                return (false, 0, None);
            };
            release.media[entry.sub.medium_index].status = if rc == 0 {
                SubStatus::Done
            } else {
                SubStatus::Error
            };
            let ended = release.is_ended();
            let body = (ended && state.rc == 0).then(|| release_response_body(release));
            (ended, state.rc, body)
        });
        if !ended {
            continue;
        }
        match body {
            Some(body) => queue_response(&env.responses, &reqc, body),
            None => {
                let err = CodedError::new(parent_rc, "medium flush failed");
                queue_error_response(&env.responses, &err, &reqc);
            }
        }
    }
}
