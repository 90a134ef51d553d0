//! Worker lifecycle primitive shared by device workers and the scheduler.
//!
//! A [`WorkerHandle`] tracks the {Running, Stopping, Stopped} state of a
//! long-lived task together with a typed stop reason (an errno value, 0
//! for a clean stop). Other threads publish work under their own locks and
//! then [`signal`](WorkerHandle::signal) the worker; the worker parks on
//! [`wait_until`](WorkerHandle::wait_until) with a deadline.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::time::Instant;

use tokio::sync::Notify;

/// Lifecycle state of a worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// Stop requested; the worker drains in-flight work.
    Stopping,
    Stopped,
}

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Shared lifecycle handle of one worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    state: AtomicU8,
    /// Stop reason, errno-scale; 0 means a clean stop.
    status: AtomicI32,
    notify: Notify,
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            status: AtomicI32::new(0),
            notify: Notify::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => WorkerState::Running,
            STOPPING => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == WorkerState::Stopping
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == WorkerState::Stopped
    }

    /// Stop reason; meaningful once the worker is stopping or stopped.
    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    /// Records an error as the stop reason. The first error wins.
    pub fn set_status(&self, errno: i32) {
        let _ = self
            .status
            .compare_exchange(0, errno, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Wakes the worker without changing its state.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// Requests a stop with the given reason and wakes the worker.
    ///
    /// A worker that is already stopped keeps its state.
    pub fn signal_stop(&self, errno: i32) {
        if errno != 0 {
            self.set_status(errno);
        }
        let _ = self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire);
        self.notify.notify_one();
    }

    /// Marks the worker as stopped. Called by the worker itself.
    pub fn mark_stopped(&self) {
        self.state.store(STOPPED, Ordering::Release);
        self.notify.notify_one();
    }

    /// Parks until signalled or until `deadline`.
    ///
    /// Returns `true` when woken by a signal, `false` on timeout.
    pub async fn wait_until(&self, deadline: Instant) -> bool {
        tokio::time::timeout_at(deadline.into(), self.notify.notified())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_initial_state_is_running() {
        let handle = WorkerHandle::new();
        assert!(handle.is_running());
        assert_eq!(handle.status(), 0);
    }

    #[test]
    fn test_signal_stop_transitions_to_stopping() {
        let handle = WorkerHandle::new();
        handle.signal_stop(0);
        assert!(handle.is_stopping());
        assert_eq!(handle.status(), 0);
    }

    #[test]
    fn test_first_stop_reason_wins() {
        let handle = WorkerHandle::new();
        handle.signal_stop(libc::EIO);
        handle.signal_stop(libc::ENODEV);
        assert_eq!(handle.status(), libc::EIO);
    }

    #[test]
    fn test_mark_stopped_is_terminal() {
        let handle = WorkerHandle::new();
        handle.signal_stop(0);
        handle.mark_stopped();
        assert!(handle.is_stopped());
        // A late stop request must not resurrect the worker.
        handle.signal_stop(libc::EIO);
        assert!(handle.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_times_out() {
        let handle = WorkerHandle::new();
        let woke = handle
            .wait_until(Instant::now() + Duration::from_millis(50))
            .await;
        assert!(!woke);
    }

    #[tokio::test]
    async fn test_wait_until_sees_signal() {
        let handle = std::sync::Arc::new(WorkerHandle::new());
        let waiter = std::sync::Arc::clone(&handle);
        let task = tokio::spawn(async move {
            waiter
                .wait_until(Instant::now() + Duration::from_secs(5))
                .await
        });
        // Give the waiter a chance to park before signalling.
        tokio::task::yield_now().await;
        handle.signal();
        assert!(task.await.unwrap());
    }
}
