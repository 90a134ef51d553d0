//! The per-family scheduler loop.
//!
//! One scheduler owns one family's devices, its incoming and retry
//! queues, and its dispatcher. Retried sub-requests drain before fresh
//! arrivals so in-flight work finishes first; a request that cannot be
//! placed stays queued and is retried at least every
//! `lrs/max_dispatch_delay_ms`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::changer::MediaChanger;
use crate::config::Settings;
use crate::device::{DeviceEnv, DeviceRegistry, DeviceSet, FsRegistry, SyncEntry};
use crate::dss::DssGateway;
use crate::error::{CodedError, OpResult};
use crate::protocol::{NotifyOp, Request, Response};
use crate::queue::TsQueue;
use crate::types::{Family, LockKind, LockOwner};

use super::dispatch::{Dispatcher, Placement};
use super::request::{
    queue_error_response, queue_response, ReqContainer, ReqParams, RespContainer, SubRequest,
    SubStatus,
};

/// Hard bound on the drain phase of a scheduler shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// One family's scheduler: devices, queues and dispatch policy.
pub struct FamilyScheduler {
    family: Family,
    env: Arc<DeviceEnv>,
    set: DeviceSet,
    dispatcher: Dispatcher,
    /// Requests accepted but not yet (fully) placed, in arrival order.
    pending: VecDeque<Arc<ReqContainer>>,
    /// Sub-requests that could not be re-placed yet.
    deferred_subs: Vec<SubRequest>,
}

impl FamilyScheduler {
    /// Builds a scheduler: locks and starts every device of the family
    /// on this host.
    ///
    /// Lock reconciliation must already have run — the daemon shell does
    /// it exactly once, before any scheduler starts and before client
    /// connections are accepted. Running it here would treat the locks a
    /// sibling scheduler just acquired as a dead predecessor's.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        family: Family,
        settings: Arc<Settings>,
        dss: Arc<dyn DssGateway>,
        changer: Arc<dyn MediaChanger>,
        fs_registry: FsRegistry,
        responses: Arc<TsQueue<RespContainer>>,
        owner: LockOwner,
        daemon_running: Arc<AtomicBool>,
    ) -> OpResult<Self> {
        let registry: DeviceRegistry = Arc::default();
        let env = Arc::new(DeviceEnv {
            dss,
            changer,
            fs_registry,
            sync: settings.sync_for(family),
            retry: settings.scsi.retry,
            settings,
            owner,
            registry,
            ongoing_formats: Arc::default(),
            responses,
            retry_queue: Arc::new(TsQueue::new()),
            incoming: Arc::new(TsQueue::new()),
            daemon_running,
        });

        let mut set = DeviceSet::new(Arc::clone(&env.registry));
        let started = set.load_from_dss(&env, family).await?;
        info!(family = %family, devices = started, "scheduler started");

        let dispatcher = Dispatcher::new(family, &env.settings);
        Ok(Self {
            family,
            env,
            set,
            dispatcher,
            pending: VecDeque::new(),
            deferred_subs: Vec::new(),
        })
    }

    /// Queue the router feeds with this family's requests.
    pub fn incoming(&self) -> Arc<TsQueue<Arc<ReqContainer>>> {
        Arc::clone(&self.env.incoming)
    }

    pub fn device_count(&self) -> usize {
        self.set.len()
    }

    /// Runs until shutdown, then drains per the shutdown protocol.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = self.env.retry_queue.notified() => {}
                _ = self.env.incoming.notified() => {}
                _ = tokio::time::sleep(self.env.settings.lrs.max_dispatch_delay) => {}
            }
            self.tick().await;
        }
        self.shutdown().await;
    }

    /// One scheduling pass: absorb arrivals, re-place retried
    /// sub-requests, then place queued requests in arrival order.
    async fn tick(&mut self) {
        self.absorb_incoming().await;

        // Retry queue before fresh arrivals.
        let mut subs = std::mem::take(&mut self.deferred_subs);
        while let Some(sub) = self.env.retry_queue.try_pop() {
            subs.push(sub);
        }
        for sub in subs {
            if let Some(back) = self.dispatcher.redispatch(sub, &self.set, &self.env).await {
                self.deferred_subs.push(back);
            }
        }

        let mut keep = VecDeque::new();
        while let Some(reqc) = self.pending.pop_front() {
            if reqc.rc() != 0 {
                continue;
            }
            match self.dispatcher.dispatch(&reqc, &self.set, &self.env).await {
                Placement::Placed | Placement::Finished => {}
                Placement::Deferred => keep.push_back(reqc),
            }
        }
        self.pending = keep;
    }

    /// Pulls everything the router queued, answering what needs no
    /// device placement.
    async fn absorb_incoming(&mut self) {
        while let Some(reqc) = self.env.incoming.try_pop() {
            match &reqc.body {
                Request::Ping => {
                    queue_response(&self.env.responses, &reqc, Response::Ping);
                }
                Request::Release { .. } => self.route_release(&reqc),
                Request::Notify { op, device, .. } => {
                    let (op, device) = (*op, device.clone());
                    self.handle_notify(&reqc, op, &device).await;
                }
                _ => self.pending.push_back(reqc),
            }
        }
    }

    /// Routes each tosync medium of a release to the device holding it.
    fn route_release(&self, reqc: &Arc<ReqContainer>) {
        let entries: Vec<_> = reqc.with_state(|state| match &state.params {
            ReqParams::Release(release) => release
                .media
                .iter()
                .enumerate()
                .map(|(idx, m)| {
                    (
                        idx,
                        m.medium.clone(),
                        m.written_size,
                        m.nb_obj,
                        m.client_rc,
                    )
                })
                .collect(),
            _ => Vec::new(),
        });

        if entries.is_empty() {
            // Nothing to flush: acknowledge immediately.
            queue_response(
                &self.env.responses,
                reqc,
                Response::Release { media: Vec::new() },
            );
            return;
        }

        for (idx, medium, written_size, nb_obj, client_rc) in entries {
            let holder = self.set.devices().into_iter().find(|d| {
                d.is_release_ready()
                    && d.with_state(|state| {
                        state
                            .loaded_medium
                            .as_ref()
                            .map(|m| m.id == medium)
                            .unwrap_or(false)
                    })
            });
            match holder {
                Some(dev) => {
                    dev.submit_sync(SyncEntry {
                        sub: SubRequest::new(Arc::clone(reqc), idx),
                        written_size,
                        nb_obj,
                        client_rc,
                        queued_at: reqc.received_at,
                    });
                }
                None => {
                    let err = CodedError::no_device(format!(
                        "medium '{medium}' is not held by any drive"
                    ));
                    warn!(medium = %medium, "release for a medium no drive holds");
                    reqc.set_rc(-err.code());
                    reqc.with_state(|state| {
                        if let ReqParams::Release(release) = &mut state.params {
                            release.media[idx].status = SubStatus::Error;
                        }
                    });
                    queue_error_response(&self.env.responses, &err, reqc);
                }
            }
        }
    }

    /// Serves admin notifications: a device appeared or must go away.
    async fn handle_notify(&mut self, reqc: &Arc<ReqContainer>, op: NotifyOp, serial: &str) {
        let outcome = match op {
            NotifyOp::DeviceAdd => match self.env.dss.get_device(self.family, serial).await {
                Ok(Some(info)) => self.set.add(&self.env, info).await,
                Ok(None) => Err(CodedError::no_entry(format!(
                    "no device '{serial}' in the metadata store"
                ))),
                Err(err) => Err(err),
            },
            NotifyOp::DeviceRemove => self.set.remove(serial, 0).await,
        };
        match outcome {
            Ok(()) => queue_response(&self.env.responses, reqc, Response::Notify),
            Err(err) => queue_error_response(&self.env.responses, &err, reqc),
        }
    }

    /// §shutdown: cancel undispatched work, stop the workers, and keep
    /// routing releases while they drain, bounded by [`SHUTDOWN_TIMEOUT`].
    async fn shutdown(&mut self) {
        info!(family = %self.family, "scheduler shutting down");
        self.env.daemon_running.store(false, Ordering::Release);

        // Cancel everything still waiting for a device.
        self.absorb_incoming().await;
        let waiting: Vec<_> = self.pending.drain(..).collect();
        for reqc in waiting {
            self.cancel_request(&reqc).await;
        }
        let mut subs = std::mem::take(&mut self.deferred_subs);
        while let Some(sub) = self.env.retry_queue.try_pop() {
            subs.push(sub);
        }
        for sub in subs {
            self.cancel_sub(sub).await;
        }

        // Workers drain their pending syncs and in-flight sub-requests.
        self.set.stop_all(0);

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        loop {
            // Releases must still reach their drives so acknowledged
            // writes can be flushed; everything else is refused.
            while let Some(reqc) = self.env.incoming.try_pop() {
                match &reqc.body {
                    Request::Release { .. } => self.route_release(&reqc),
                    _ => {
                        let err = CodedError::cancelled("daemon is shutting down");
                        queue_error_response(&self.env.responses, &err, &reqc);
                    }
                }
            }
            let all_stopped = self
                .set
                .devices()
                .iter()
                .all(|d| d.thread.is_stopped());
            if all_stopped || Instant::now() >= deadline {
                break;
            }
            let _ = tokio::time::timeout(
                Duration::from_millis(50),
                self.env.incoming.notified(),
            )
            .await;
        }

        if !self.set.join_all(deadline).await {
            warn!(family = %self.family, "unclean scheduler shutdown");
        }
    }

    /// Fails a queued request with ECANCELED, releasing any media locks
    /// it accumulated.
    async fn cancel_request(&self, reqc: &Arc<ReqContainer>) {
        let err = CodedError::cancelled("daemon is shutting down");
        reqc.set_rc(-err.code());
        let media = reqc.with_state(|state| {
            let mut media = Vec::new();
            match &mut state.params {
                ReqParams::Alloc(alloc) => {
                    for slot in &mut alloc.slots {
                        if !slot.submitted {
                            slot.status = SubStatus::Cancel;
                            if let Some(m) = slot.medium.take() {
                                media.push(m);
                            }
                        }
                    }
                }
                ReqParams::Format(params) => {
                    if let Some(m) = params.medium.take() {
                        media.push(m);
                    }
                }
                _ => {}
            }
            media
        });
        for medium in media {
            if let Err(unlock_err) = self
                .env
                .dss
                .unlock(LockKind::Media, &medium.id.name, &self.env.owner)
                .await
            {
                warn!(
                    medium = %medium.id, error = %unlock_err,
                    "cannot release lock while cancelling"
                );
            }
        }
        queue_error_response(&self.env.responses, &err, reqc);
        debug!(request = reqc.local_id, "request cancelled by shutdown");
    }

    async fn cancel_sub(&self, sub: SubRequest) {
        let err = CodedError::cancelled("daemon is shutting down");
        sub.reqc.set_rc(-err.code());
        let medium = sub.reqc.with_state(|state| {
            if let ReqParams::Alloc(alloc) = &mut state.params {
                let slot = &mut alloc.slots[sub.medium_index];
                slot.status = SubStatus::Cancel;
                slot.medium.take()
            } else {
                None
            }
        });
        if let Some(medium) = medium {
            if let Err(unlock_err) = self
                .env
                .dss
                .unlock(LockKind::Media, &medium.id.name, &self.env.owner)
                .await
            {
                warn!(
                    medium = %medium.id, error = %unlock_err,
                    "cannot release lock while cancelling"
                );
            }
        }
        queue_error_response(&self.env.responses, &err, &sub.reqc);
    }
}
