//! Generic retry helper for library, filesystem and DSS calls.
//!
//! Each underlying call either succeeds, fails fatally, or deserves a
//! retry after a short or long delay. A classifier function maps the error
//! to a [`RetryClass`]; the helper sleeps and iterates up to the
//! configured attempt count.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{errno_name, CodedError, OpResult};

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Give up immediately.
    Fatal,
    /// Transient glitch, retry after the short delay (~1 s).
    Short,
    /// Device settling, retry after the long delay (~5 s).
    Long,
}

/// Retry counts and delays, from the `scsi` configuration section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub count: u32,
    pub short_delay: Duration,
    pub long_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            count: 5,
            short_delay: Duration::from_secs(1),
            long_delay: Duration::from_secs(5),
        }
    }
}

/// Default classifier for SCSI-path errors.
pub fn scsi_retry_class(err: &CodedError) -> RetryClass {
    match err.code() {
        libc::EAGAIN | libc::EINTR => RetryClass::Short,
        libc::EBUSY | libc::ETIMEDOUT | libc::EIO => RetryClass::Long,
        _ => RetryClass::Fatal,
    }
}

/// Runs `op`, retrying per `classify` until success, a fatal error, or
/// exhaustion of `policy.count` retries.
pub async fn with_retry<T, F, Fut, C>(policy: RetryPolicy, classify: C, mut op: F) -> OpResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OpResult<T>>,
    C: Fn(&CodedError) -> RetryClass,
{
    let mut remaining = policy.count;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                if class == RetryClass::Fatal || remaining == 0 {
                    return Err(err);
                }
                remaining -= 1;
                let delay = match class {
                    RetryClass::Short => policy.short_delay,
                    RetryClass::Long => policy.long_delay,
                    RetryClass::Fatal => unreachable!(),
                };
                debug!(
                    error = %err,
                    errno = errno_name(err.code()),
                    remaining,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            count: 5,
            short_delay: Duration::from_millis(1),
            long_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_success_needs_no_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let result = with_retry(policy(), scsi_retry_class, move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let result: OpResult<()> = with_retry(policy(), scsi_retry_class, move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(CodedError::invalid("bad address"))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().code(), libc::EINVAL);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_error_retries_then_succeeds() {
        // Fails twice, succeeds on the third attempt.
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let result = with_retry(policy(), scsi_retry_class, move || {
            let seen = Arc::clone(&seen);
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CodedError::busy("drive settling"))
                } else {
                    Ok("mounted")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "mounted");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_count_exhaustion() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let limited = RetryPolicy {
            count: 2,
            ..policy()
        };
        let result: OpResult<()> = with_retry(limited, scsi_retry_class, move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(CodedError::timed_out("library not answering"))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().code(), libc::ETIMEDOUT);
        // Initial attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_scsi_classifier() {
        assert_eq!(
            scsi_retry_class(&CodedError::new(libc::EAGAIN, "x")),
            RetryClass::Short
        );
        assert_eq!(
            scsi_retry_class(&CodedError::new(libc::EINTR, "x")),
            RetryClass::Short
        );
        assert_eq!(
            scsi_retry_class(&CodedError::busy("x")),
            RetryClass::Long
        );
        assert_eq!(scsi_retry_class(&CodedError::io("x")), RetryClass::Long);
        assert_eq!(
            scsi_retry_class(&CodedError::invalid("x")),
            RetryClass::Fatal
        );
    }
}
