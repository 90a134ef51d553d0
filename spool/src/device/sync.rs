//! Per-device sync batching.
//!
//! Medium flushes are expensive (an LTFS sync rewinds heads), so client
//! releases accumulate in a per-device batch and a single flush
//! acknowledges all of them. The batch becomes due on a count, age or
//! size threshold, when the daemon or the worker is stopping, or
//! immediately when a client reported an I/O error on release.

use std::sync::Arc;
use std::time::Instant;

use crate::config::SyncSettings;
use crate::sched::request::{ReqContainer, ReqParams, SubRequest, SubStatus};
use crate::time::is_past;

/// One pending release on this device.
#[derive(Debug)]
pub struct SyncEntry {
    pub sub: SubRequest,
    pub written_size: u64,
    pub nb_obj: u64,
    pub client_rc: i32,
    /// Arrival time of the parent release request.
    pub queued_at: Instant,
}

/// The pending release set of one device.
#[derive(Debug, Default)]
pub struct SyncBatch {
    entries: Vec<SyncEntry>,
    oldest: Option<Instant>,
    bytes: u64,
}

impl SyncBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes
    }

    /// Sum of objects written across the pending releases.
    pub fn total_objects(&self) -> u64 {
        self.entries.iter().map(|e| e.nb_obj).sum()
    }

    pub fn oldest(&self) -> Option<Instant> {
        self.oldest
    }

    pub fn push(&mut self, entry: SyncEntry) {
        self.bytes += entry.written_size;
        self.oldest = Some(match self.oldest {
            Some(current) if current <= entry.queued_at => current,
            _ => entry.queued_at,
        });
        self.entries.push(entry);
    }

    /// Takes every entry out, oldest first, resetting the accumulators.
    pub fn drain(&mut self) -> Vec<SyncEntry> {
        self.bytes = 0;
        self.oldest = None;
        std::mem::take(&mut self.entries)
    }

    fn recompute(&mut self) {
        self.bytes = self.entries.iter().map(|e| e.written_size).sum();
        self.oldest = self.entries.iter().map(|e| e.queued_at).min();
    }

    /// Removes entries whose parent request already failed on another
    /// device, marking them CANCEL. Returns the containers that reached
    /// their terminal state through this scrub, so the caller can check
    /// for pending error responses.
    pub fn scrub_cancelled(&mut self) -> Vec<Arc<ReqContainer>> {
        let mut ended = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            let parent_failed = entry.sub.reqc.rc() != 0;
            if !parent_failed {
                kept.push(entry);
                continue;
            }
            let now_ended = entry.sub.reqc.with_state(|state| {
                if let ReqParams::Release(release) = &mut state.params {
                    release.media[entry.sub.medium_index].status = SubStatus::Cancel;
                    release.is_ended()
                } else {
                    false
                }
            });
            if now_ended {
                ended.push(Arc::clone(&entry.sub.reqc));
            }
        }
        self.entries = kept;
        self.recompute();
        ended
    }

    /// Evaluates whether a flush is due. Must be called under the device
    /// mutex.
    pub fn needs_sync(
        &self,
        thresholds: &SyncSettings,
        worker_stopping: bool,
        daemon_stopping: bool,
        last_client_rc: i32,
    ) -> bool {
        let pending = !self.is_empty();
        let mut due = pending
            && (self.len() >= thresholds.nb_req
                || self
                    .oldest
                    .map(|oldest| is_past(oldest + thresholds.time))
                    .unwrap_or(false)
                || self.bytes >= thresholds.wsize_kb * 1024);
        due |= daemon_stopping && pending;
        due |= worker_stopping && pending;
        // A client-reported error forces a drain without physical sync;
        // the device and medium statuses are settled by the flush path.
        due |= last_client_rc != 0;
        due
    }
}
