//! Wakeup-date computation for device workers.
//!
//! A device worker sleeps until either it is signalled or its sync batch
//! becomes due. The wakeup date is floored at [`MIN_SLEEP`] so a device
//! with an overdue batch cannot spin.

use std::time::{Duration, Instant};

/// Minimum sleep between two device loop iterations.
pub const MIN_SLEEP: Duration = Duration::from_millis(10);

/// Computes the next wakeup date of a device worker.
///
/// With no pending release the worker sleeps a full sync period; otherwise
/// it wakes when the oldest pending release reaches the sync deadline, but
/// never sooner than `now + MIN_SLEEP`.
pub fn compute_wakeup(now: Instant, oldest_tosync: Option<Instant>, sync_time: Duration) -> Instant {
    match oldest_tosync {
        None => now + sync_time,
        Some(oldest) => {
            let date = oldest + sync_time;
            let floor = now + MIN_SLEEP;
            if date < floor {
                floor
            } else {
                date
            }
        }
    }
}

/// Whether an instant is already behind us.
pub fn is_past(t: Instant) -> bool {
    Instant::now() >= t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_pending_release_sleeps_full_period() {
        let now = Instant::now();
        let sync_time = Duration::from_secs(5);
        assert_eq!(compute_wakeup(now, None, sync_time), now + sync_time);
    }

    #[test]
    fn test_pending_release_wakes_at_deadline() {
        let now = Instant::now();
        let oldest = now + Duration::from_secs(1);
        let wakeup = compute_wakeup(now, Some(oldest), Duration::from_secs(5));
        assert_eq!(wakeup, oldest + Duration::from_secs(5));
    }

    #[test]
    fn test_overdue_release_floors_at_min_sleep() {
        let now = Instant::now();
        let oldest = now - Duration::from_secs(60);
        let wakeup = compute_wakeup(now, Some(oldest), Duration::from_millis(100));
        assert_eq!(wakeup, now + MIN_SLEEP);
    }

    #[test]
    fn test_is_past() {
        assert!(is_past(Instant::now() - Duration::from_millis(1)));
        assert!(!is_past(Instant::now() + Duration::from_secs(60)));
    }
}
