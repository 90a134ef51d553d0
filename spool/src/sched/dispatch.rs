//! Dispatch: mapping allocation requests to devices.
//!
//! Three algorithms are recognized. `fifo` serves the oldest request
//! first, scanning idle devices in serial order. `grouped_read` coalesces
//! reads that want a medium already in a drive onto that drive, waiting
//! for it instead of spreading mounts. `fair_share` bounds the number of
//! in-flight requests per technology and per kind between configured
//! minima and maxima.
//!
//! Invariants honored here: a request that cannot be placed stays queued;
//! a medium already locked for a request keeps its lock when dispatch
//! defers or fair-share refuses admission.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{DispatchAlgo, FairShareBounds, Settings};
use crate::device::{Device, DeviceEnv, DeviceSet};
use crate::error::CodedError;
use crate::protocol::{Request, WriteReq};
use crate::types::{AdmStatus, Family, FsStatus, LockKind, MediumId, MediumInfo};

use super::request::{
    queue_error_response, AllocParams, AllocSlot, ReqClass, ReqContainer, ReqParams, SubRequest,
    SubStatus,
};

/// Outcome of a dispatch attempt for a whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Every outstanding sub-request reached a device.
    Placed,
    /// Cannot place (fully) now; the request stays queued and any media
    /// locks it took are retained.
    Deferred,
    /// A response was emitted; the request leaves the queue.
    Finished,
}

/// Outcome of placing one allocation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOutcome {
    Placed,
    Deferred,
    /// No usable medium remains for this slot.
    NoMedium,
}

/// Per-tick admission counters: placements this tick count against the
/// fair-share maxima alongside already-running work.
type TickCounts = HashMap<(String, usize), u32>;

/// The request-to-device placement policy of one family scheduler.
pub struct Dispatcher {
    family: Family,
    algo: DispatchAlgo,
    read_algo: DispatchAlgo,
    fair_share: HashMap<String, FairShareBounds>,
}

impl Dispatcher {
    pub fn new(family: Family, settings: &Settings) -> Self {
        let io = settings.io_sched_for(family);
        Self {
            family,
            algo: io.dispatch_algo,
            read_algo: io.read_algo,
            fair_share: settings.fair_share.clone(),
        }
    }

    /// Attempts to place one queued request.
    pub async fn dispatch(
        &self,
        reqc: &Arc<ReqContainer>,
        set: &DeviceSet,
        env: &DeviceEnv,
    ) -> Placement {
        match reqc.body.clone() {
            Request::Format { medium, .. } => self.dispatch_format(reqc, &medium, set, env).await,
            Request::ReadAlloc { n_required, media } => {
                self.dispatch_read(reqc, n_required, &media, set, env).await
            }
            Request::WriteAlloc { media, .. } => {
                self.dispatch_write(reqc, &media, set, env).await
            }
            _ => Placement::Finished,
        }
    }

    /// Attempts to place a sub-request coming back through the retry
    /// queue. Returns the sub-request when it must stay queued.
    pub async fn redispatch(
        &self,
        sub: SubRequest,
        set: &DeviceSet,
        env: &DeviceEnv,
    ) -> Option<SubRequest> {
        if sub.reqc.rc() != 0 {
            // The request died while this sub-request waited for a
            // retry; drop it and free its medium.
            let freed = sub.reqc.with_state(|state| {
                if let ReqParams::Alloc(alloc) = &mut state.params {
                    let slot = &mut alloc.slots[sub.medium_index];
                    slot.status = SubStatus::Cancel;
                    slot.medium.take()
                } else {
                    None
                }
            });
            if let Some(medium) = freed {
                if let Err(err) = env
                    .dss
                    .unlock(LockKind::Media, &medium.id.name, &env.owner)
                    .await
                {
                    warn!(error = %err, "cannot release lock of cancelled medium");
                }
            }
            return None;
        }

        let mut tick = TickCounts::new();
        let outcome = match sub.reqc.class() {
            Some(ReqClass::Write) => {
                let Request::WriteAlloc { media, .. } = reqc_body(&sub.reqc) else {
                    return None;
                };
                self.place_write_slot(&sub.reqc, &media[sub.medium_index], &sub, set, env, &mut tick)
                    .await
            }
            Some(ReqClass::Read) => self.place_read_slot(&sub.reqc, &sub, set, env, &mut tick).await,
            _ => return None,
        };
        match outcome {
            SlotOutcome::Placed => None,
            SlotOutcome::Deferred => Some(sub),
            SlotOutcome::NoMedium => {
                let err = CodedError::no_device("no usable medium left for the allocation");
                sub.reqc.set_rc(-err.code());
                sub.reqc.with_state(|state| {
                    if let ReqParams::Alloc(alloc) = &mut state.params {
                        alloc.slots[sub.medium_index].status = SubStatus::Error;
                    }
                });
                queue_error_response(&env.responses, &err, &sub.reqc);
                None
            }
        }
    }

    // ---------------------------------------------------------------
    // Format
    // ---------------------------------------------------------------

    async fn dispatch_format(
        &self,
        reqc: &Arc<ReqContainer>,
        target: &MediumId,
        set: &DeviceSet,
        env: &DeviceEnv,
    ) -> Placement {
        if env.ongoing_formats.lock().contains(target) {
            debug!(medium = %target, "format already in flight, deferring");
            return Placement::Deferred;
        }

        let devices = set.devices();
        let mut tick = TickCounts::new();

        // A target kept from an earlier refused attempt is already
        // locked; place it without touching the DSS again.
        let kept = reqc.with_state(|state| match &mut state.params {
            ReqParams::Format(params) => params.medium.take(),
            _ => None,
        });
        if let Some(medium) = kept {
            let Some(dev) = devices.iter().find(|d| {
                d.is_sched_ready()
                    && self.techno_compatible(d, &medium)
                    && self.admit(d.technology.as_deref(), ReqClass::Format, &devices, &tick)
            }) else {
                reqc.with_state(|state| {
                    if let ReqParams::Format(params) = &mut state.params {
                        params.medium = Some(medium);
                    }
                });
                return Placement::Deferred;
            };
            let dev = Arc::clone(dev);
            return self.submit_format(reqc, target, Some(medium), &dev, env);
        }

        // The target may already sit in one of our drives.
        if let Some(dev) = devices.iter().find(|d| {
            d.with_state(|state| {
                state
                    .loaded_medium
                    .as_ref()
                    .map(|m| &m.id == target)
                    .unwrap_or(false)
            })
        }) {
            if !dev.is_sched_ready()
                || !self.admit(dev.technology.as_deref(), ReqClass::Format, &devices, &tick)
            {
                return Placement::Deferred;
            }
            return self.submit_format(reqc, target, None, dev, env);
        }

        let medium = match env.dss.get_medium(target).await {
            Err(err) => {
                queue_error_response(&env.responses, &err, reqc);
                return Placement::Finished;
            }
            Ok(None) => {
                let err = CodedError::no_entry(format!("no such medium '{target}'"));
                queue_error_response(&env.responses, &err, reqc);
                return Placement::Finished;
            }
            Ok(Some(medium)) => medium,
        };

        if medium.adm_status == AdmStatus::Failed {
            let err = CodedError::new(
                libc::EPERM,
                format!("medium '{target}' is failed, cannot format"),
            );
            queue_error_response(&env.responses, &err, reqc);
            return Placement::Finished;
        }
        if medium.fs.status != FsStatus::Blank {
            let err = CodedError::exists(format!(
                "medium '{target}' already contains a filesystem"
            ));
            queue_error_response(&env.responses, &err, reqc);
            return Placement::Finished;
        }

        let compatible: Vec<Arc<Device>> = devices
            .iter()
            .filter(|d| self.techno_compatible(d, &medium))
            .cloned()
            .collect();
        if compatible.is_empty() {
            let err = CodedError::no_device(format!(
                "no drive is capable of writing medium '{target}'"
            ));
            queue_error_response(&env.responses, &err, reqc);
            return Placement::Finished;
        }

        let Some(dev) = compatible.iter().find(|d| {
            d.is_sched_ready()
                && self.admit(d.technology.as_deref(), ReqClass::Format, &devices, &tick)
        }) else {
            return Placement::Deferred;
        };

        if let Err(err) = env.dss.lock(LockKind::Media, &target.name, &env.owner).await {
            debug!(medium = %target, error = %err, "format target is locked, deferring");
            return Placement::Deferred;
        }
        self.submit_format(reqc, target, Some(medium), dev, env)
    }

    fn submit_format(
        &self,
        reqc: &Arc<ReqContainer>,
        target: &MediumId,
        medium: Option<MediumInfo>,
        dev: &Arc<Device>,
        env: &DeviceEnv,
    ) -> Placement {
        reqc.with_state(|state| {
            if let ReqParams::Format(params) = &mut state.params {
                params.medium = medium;
            }
        });
        env.ongoing_formats.lock().insert(target.clone());
        match dev.submit(SubRequest::new(Arc::clone(reqc), 0), ReqClass::Format) {
            Ok(()) => Placement::Placed,
            Err(err) => {
                debug!(device = %dev.serial, error = %err, "format submit refused");
                env.ongoing_formats.lock().remove(target);
                // A lock taken for the target stays with the request: it
                // retries from the queue with the lock in hand.
                Placement::Deferred
            }
        }
    }

    // ---------------------------------------------------------------
    // Write allocation
    // ---------------------------------------------------------------

    async fn dispatch_write(
        &self,
        reqc: &Arc<ReqContainer>,
        media: &[WriteReq],
        set: &DeviceSet,
        env: &DeviceEnv,
    ) -> Placement {
        ensure_alloc_params(reqc, ReqClass::Write, media.len(), Vec::new());

        let mut tick = TickCounts::new();
        let mut all_placed = true;
        for (idx, want) in media.iter().enumerate() {
            if slot_is_settled(reqc, idx) {
                continue;
            }
            let sub = SubRequest::new(Arc::clone(reqc), idx);
            match self
                .place_write_slot(reqc, want, &sub, set, env, &mut tick)
                .await
            {
                SlotOutcome::Placed => {}
                SlotOutcome::Deferred => all_placed = false,
                SlotOutcome::NoMedium => {
                    let err = CodedError::no_space(format!(
                        "no medium with {} free bytes for the write allocation",
                        want.size
                    ));
                    reqc.set_rc(-err.code());
                    reqc.with_state(|state| {
                        if let ReqParams::Alloc(alloc) = &mut state.params {
                            alloc.slots[idx].status = SubStatus::Error;
                        }
                    });
                    queue_error_response(&env.responses, &err, reqc);
                    return Placement::Finished;
                }
            }
        }
        if all_placed {
            Placement::Placed
        } else {
            Placement::Deferred
        }
    }

    /// Places one write slot: pick a medium with enough space and a
    /// drive to serve it.
    async fn place_write_slot(
        &self,
        reqc: &Arc<ReqContainer>,
        want: &WriteReq,
        sub: &SubRequest,
        set: &DeviceSet,
        env: &DeviceEnv,
        tick: &mut TickCounts,
    ) -> SlotOutcome {
        let idx = sub.medium_index;
        let devices = set.devices();

        // A medium kept from a failed attempt travels with its lock; a
        // busy pool only defers it, never fails it.
        let kept = reqc.with_state(|state| match &state.params {
            ReqParams::Alloc(alloc) => alloc.slots[idx].medium.clone(),
            _ => None,
        });
        if let Some(medium) = kept {
            return match self
                .submit_to_ready_device(reqc, sub, &medium, None, &devices, env, tick)
                .await
            {
                SlotOutcome::NoMedium => SlotOutcome::Deferred,
                outcome => outcome,
            };
        }

        // Fresh selection: writable, correctly tagged, enough room.
        let candidates = match env.dss.list_media(self.family).await {
            Ok(media) => media,
            Err(err) => {
                warn!(error = %err, "cannot list media, deferring write allocation");
                return SlotOutcome::Deferred;
            }
        };
        let reserved = reserved_media(reqc);
        let mut usable: Vec<MediumInfo> = candidates
            .into_iter()
            .filter(|m| {
                m.is_writable()
                    && m.has_tags(&want.tags)
                    && m.stats.phys_spc_free >= want.size
                    && !reserved.contains(&m.id.name)
            })
            .collect();
        if usable.is_empty() {
            return SlotOutcome::NoMedium;
        }
        // Prefer media already sitting in an idle drive, then the widest
        // free space.
        usable.sort_by(|a, b| {
            let a_loaded = find_holder(&devices, &a.id).is_some();
            let b_loaded = find_holder(&devices, &b.id).is_some();
            b_loaded
                .cmp(&a_loaded)
                .then(b.stats.phys_spc_free.cmp(&a.stats.phys_spc_free))
        });

        let mut saw_busy = false;
        for medium in usable {
            if let Some(holder) = find_holder(&devices, &medium.id) {
                if !holder.is_sched_ready() {
                    saw_busy = true;
                    continue;
                }
                if !self.admit(holder.technology.as_deref(), ReqClass::Write, &devices, tick) {
                    return SlotOutcome::Deferred;
                }
                return self.submit_slot(reqc, sub, None, &holder, env, tick);
            }
            match env.dss.lock_of(LockKind::Media, &medium.id.name).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "cannot check medium lock, deferring");
                    return SlotOutcome::Deferred;
                }
            }
            match self
                .submit_to_ready_device(reqc, sub, &medium, Some(&medium), &devices, env, tick)
                .await
            {
                SlotOutcome::NoMedium => {
                    saw_busy = true;
                    continue;
                }
                outcome => return outcome,
            }
        }
        if saw_busy {
            SlotOutcome::Deferred
        } else {
            SlotOutcome::NoMedium
        }
    }

    // ---------------------------------------------------------------
    // Read allocation
    // ---------------------------------------------------------------

    async fn dispatch_read(
        &self,
        reqc: &Arc<ReqContainer>,
        n_required: usize,
        media: &[MediumId],
        set: &DeviceSet,
        env: &DeviceEnv,
    ) -> Placement {
        ensure_alloc_params(reqc, ReqClass::Read, n_required, media.to_vec());

        let mut tick = TickCounts::new();
        let mut all_placed = true;
        for idx in 0..n_required {
            if slot_is_settled(reqc, idx) {
                continue;
            }
            let sub = SubRequest::new(Arc::clone(reqc), idx);
            match self.place_read_slot(reqc, &sub, set, env, &mut tick).await {
                SlotOutcome::Placed => {}
                SlotOutcome::Deferred => all_placed = false,
                SlotOutcome::NoMedium => {
                    let err = CodedError::no_device(
                        "not enough readable media for the allocation",
                    );
                    reqc.set_rc(-err.code());
                    reqc.with_state(|state| {
                        if let ReqParams::Alloc(alloc) = &mut state.params {
                            alloc.slots[idx].status = SubStatus::Error;
                        }
                    });
                    queue_error_response(&env.responses, &err, reqc);
                    return Placement::Finished;
                }
            }
        }
        if all_placed {
            Placement::Placed
        } else {
            Placement::Deferred
        }
    }

    /// Places one read slot, consuming spare candidates until one can be
    /// served.
    async fn place_read_slot(
        &self,
        reqc: &Arc<ReqContainer>,
        sub: &SubRequest,
        set: &DeviceSet,
        env: &DeviceEnv,
        tick: &mut TickCounts,
    ) -> SlotOutcome {
        let idx = sub.medium_index;
        let devices = set.devices();

        // A medium kept from a failed attempt travels with its lock; a
        // busy pool only defers it, never fails it.
        let kept = reqc.with_state(|state| match &state.params {
            ReqParams::Alloc(alloc) => alloc.slots[idx].medium.clone(),
            _ => None,
        });
        if let Some(medium) = kept {
            return match self
                .submit_to_ready_device(reqc, sub, &medium, None, &devices, env, tick)
                .await
            {
                SlotOutcome::NoMedium => SlotOutcome::Deferred,
                outcome => outcome,
            };
        }

        let grouped = self.read_algo == DispatchAlgo::GroupedRead;
        let mut saw_busy = false;
        loop {
            let Some(candidate) = reqc.with_state(|state| match &mut state.params {
                ReqParams::Alloc(alloc) => {
                    if alloc.spare_candidates.is_empty() {
                        None
                    } else {
                        Some(alloc.spare_candidates.remove(0))
                    }
                }
                _ => None,
            }) else {
                return if saw_busy {
                    SlotOutcome::Deferred
                } else {
                    SlotOutcome::NoMedium
                };
            };

            let medium = match env.dss.get_medium(&candidate).await {
                Ok(Some(m)) => m,
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, "cannot resolve read candidate, deferring");
                    put_candidate_back(reqc, candidate);
                    return SlotOutcome::Deferred;
                }
            };
            if medium.adm_status != AdmStatus::Unlocked
                || medium.fs.status == FsStatus::Blank
            {
                continue;
            }

            // Medium already in one of our drives: serve it there. The
            // grouped_read policy waits for a busy holder to amortize the
            // mount; fifo falls through to the alternates.
            if let Some(holder) = find_holder(&devices, &medium.id) {
                if holder.is_sched_ready() {
                    if !self.admit(holder.technology.as_deref(), ReqClass::Read, &devices, tick) {
                        // Admission refused: the medium keeps its lock,
                        // it stays in the drive.
                        put_candidate_back(reqc, candidate);
                        return SlotOutcome::Deferred;
                    }
                    return self.submit_slot(reqc, sub, None, &holder, env, tick);
                }
                if grouped {
                    put_candidate_back(reqc, candidate);
                    return SlotOutcome::Deferred;
                }
                saw_busy = true;
                continue;
            }

            match env.dss.lock_of(LockKind::Media, &medium.id.name).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "cannot check medium lock, deferring");
                    put_candidate_back(reqc, candidate);
                    return SlotOutcome::Deferred;
                }
            }
            match self
                .submit_to_ready_device(reqc, sub, &medium, Some(&medium), &devices, env, tick)
                .await
            {
                SlotOutcome::NoMedium => {
                    saw_busy = true;
                    continue;
                }
                SlotOutcome::Deferred => {
                    put_candidate_back(reqc, candidate);
                    return SlotOutcome::Deferred;
                }
                SlotOutcome::Placed => return SlotOutcome::Placed,
            }
        }
    }

    // ---------------------------------------------------------------
    // Shared placement helpers
    // ---------------------------------------------------------------

    /// Finds a ready, compatible drive for `medium` and submits the slot,
    /// locking the medium first when `to_lock` asks for it.
    ///
    /// Returns NoMedium when no compatible drive is ready (the caller
    /// interprets it against its candidate pool).
    #[allow(clippy::too_many_arguments)]
    async fn submit_to_ready_device(
        &self,
        reqc: &Arc<ReqContainer>,
        sub: &SubRequest,
        medium: &MediumInfo,
        to_lock: Option<&MediumInfo>,
        devices: &[Arc<Device>],
        env: &DeviceEnv,
        tick: &mut TickCounts,
    ) -> SlotOutcome {
        let class = reqc.class().unwrap_or(ReqClass::Read);
        let Some(dev) = devices
            .iter()
            .find(|d| d.is_sched_ready() && self.techno_compatible(d, medium))
        else {
            return SlotOutcome::NoMedium;
        };
        if !self.admit(dev.technology.as_deref(), class, devices, tick) {
            return SlotOutcome::Deferred;
        }
        // Hold the drive across the lock round-trip so a concurrent
        // placement cannot double-book it.
        if !dev.reserve_for_dispatch() {
            return SlotOutcome::Deferred;
        }
        if let Some(m) = to_lock {
            if let Err(err) = env.dss.lock(LockKind::Media, &m.id.name, &env.owner).await {
                debug!(medium = %m.id, error = %err, "medium got locked, trying later");
                dev.release_dispatch_reservation();
                return SlotOutcome::Deferred;
            }
            reqc.with_state(|state| {
                if let ReqParams::Alloc(alloc) = &mut state.params {
                    alloc.slots[sub.medium_index].medium = Some(m.clone());
                }
            });
        }
        let outcome = self.submit_slot(reqc, sub, to_lock.map(|_| ()), dev, env, tick);
        if outcome != SlotOutcome::Placed {
            dev.release_dispatch_reservation();
        }
        outcome
    }

    /// Hands the slot's sub-request to a device and records the tick
    /// placement for fair-share accounting.
    fn submit_slot(
        &self,
        reqc: &Arc<ReqContainer>,
        sub: &SubRequest,
        _locked: Option<()>,
        dev: &Arc<Device>,
        env: &DeviceEnv,
        tick: &mut TickCounts,
    ) -> SlotOutcome {
        let class = reqc.class().unwrap_or(ReqClass::Read);
        match dev.submit(sub.clone(), class) {
            Ok(()) => {
                reqc.with_state(|state| {
                    if let ReqParams::Alloc(alloc) = &mut state.params {
                        alloc.slots[sub.medium_index].submitted = true;
                    }
                });
                if let Some(techno) = dev.technology.as_deref() {
                    *tick
                        .entry((techno.to_string(), class.index()))
                        .or_insert(0) += 1;
                }
                debug!(
                    device = %dev.serial, request = reqc.local_id,
                    slot = sub.medium_index, "sub-request placed"
                );
                SlotOutcome::Placed
            }
            Err(err) => {
                debug!(device = %dev.serial, error = %err, "submit refused");
                let _ = env;
                SlotOutcome::Deferred
            }
        }
    }

    /// Whether a drive generation can serve a medium. The model string of
    /// a tape medium is its generation; the match is case-sensitive.
    fn techno_compatible(&self, dev: &Device, medium: &MediumInfo) -> bool {
        if self.family != Family::Tape {
            return true;
        }
        match (&dev.technology, &medium.model) {
            (Some(drive_gen), Some(medium_gen)) => drive_gen == medium_gen,
            _ => true,
        }
    }

    /// Fair-share admission: the in-flight count of (technology, class)
    /// must stay under the configured maximum, and idle drives are kept
    /// for classes still under their minimum reservation.
    fn admit(
        &self,
        techno: Option<&str>,
        class: ReqClass,
        devices: &[Arc<Device>],
        tick: &TickCounts,
    ) -> bool {
        if self.algo != DispatchAlgo::FairShare {
            return true;
        }
        let Some(techno) = techno else { return true };
        let Some(bounds) = self.fair_share.get(techno) else {
            return true;
        };

        let mut in_flight = [0u32; 3];
        let mut idle = 0u32;
        for dev in devices {
            if dev.technology.as_deref() != Some(techno) {
                continue;
            }
            let snapshot = dev.snapshot();
            if let Some(running) = snapshot.current_class {
                in_flight[running.index()] += 1;
            } else if snapshot.sched_ready {
                idle += 1;
            }
        }
        for ((t, class_idx), count) in tick {
            if t == techno {
                in_flight[*class_idx] += count;
                idle = idle.saturating_sub(*count);
            }
        }

        let wanted = class.index();
        if in_flight[wanted] >= bounds.max[wanted] {
            return false;
        }
        // Soft minima: under contention, leave idle drives to classes
        // still short of their reservation.
        if in_flight[wanted] >= bounds.min[wanted] {
            let deficit: u32 = (0..3)
                .filter(|k| *k != wanted)
                .map(|k| bounds.min[k].saturating_sub(in_flight[k]))
                .sum();
            if deficit >= idle {
                return false;
            }
        }
        true
    }
}

/// Initializes the allocation params of a container on its first
/// dispatch attempt.
fn ensure_alloc_params(
    reqc: &Arc<ReqContainer>,
    class: ReqClass,
    n_slots: usize,
    spare_candidates: Vec<MediumId>,
) {
    reqc.with_state(|state| {
        if matches!(state.params, ReqParams::Simple) {
            state.params = ReqParams::Alloc(AllocParams {
                class,
                slots: (0..n_slots).map(|_| AllocSlot::new(None)).collect(),
                spare_candidates,
            });
        }
    });
}

fn slot_is_settled(reqc: &Arc<ReqContainer>, idx: usize) -> bool {
    reqc.with_state(|state| match &state.params {
        ReqParams::Alloc(alloc) => {
            let slot = &alloc.slots[idx];
            slot.submitted || slot.status.is_terminal()
        }
        _ => true,
    })
}

fn put_candidate_back(reqc: &Arc<ReqContainer>, candidate: MediumId) {
    reqc.with_state(|state| {
        if let ReqParams::Alloc(alloc) = &mut state.params {
            alloc.spare_candidates.insert(0, candidate);
        }
    });
}

/// Media already reserved by other slots of this request.
fn reserved_media(reqc: &Arc<ReqContainer>) -> HashSet<String> {
    reqc.with_state(|state| match &state.params {
        ReqParams::Alloc(alloc) => alloc
            .slots
            .iter()
            .filter_map(|s| s.medium.as_ref().map(|m| m.id.name.clone()))
            .collect(),
        _ => HashSet::new(),
    })
}

/// The device currently holding a medium, if any.
fn find_holder(devices: &[Arc<Device>], id: &MediumId) -> Option<Arc<Device>> {
    devices
        .iter()
        .find(|d| {
            d.with_state(|state| {
                state
                    .loaded_medium
                    .as_ref()
                    .map(|m| &m.id == id)
                    .unwrap_or(false)
            })
        })
        .cloned()
}

fn reqc_body(reqc: &Arc<ReqContainer>) -> Request {
    reqc.body.clone()
}
