//! Errno-carrying error type shared by device and scheduler operations.
//!
//! Client responses, DSS state transitions and daemon exit codes all speak
//! errno-scale integers, so every fallible operation in the core returns a
//! [`CodedError`] pairing a `libc` error code with a human-readable
//! context string.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias used throughout the device and scheduler layers.
pub type OpResult<T> = Result<T, CodedError>;

/// An error carrying an errno-scale code.
#[derive(Debug, Clone, Error)]
pub struct CodedError {
    code: i32,
    msg: String,
}

impl CodedError {
    /// Creates an error from a positive `libc` error code and a message.
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code: code.abs(),
            msg: msg.into(),
        }
    }

    /// The positive errno value of this error.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// The error message without the errno decoration.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Rebuilds the error with a different code, keeping the message.
    pub fn with_code(self, code: i32) -> Self {
        Self {
            code: code.abs(),
            msg: self.msg,
        }
    }

    /// Wraps an I/O error, preserving its OS error code when present.
    pub fn from_io(err: io::Error, context: impl Into<String>) -> Self {
        let code = err.raw_os_error().unwrap_or(libc::EIO);
        Self::new(code, format!("{}: {}", context.into(), err))
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::new(libc::EBUSY, msg)
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(libc::EINVAL, msg)
    }

    pub fn no_space(msg: impl Into<String>) -> Self {
        Self::new(libc::ENOSPC, msg)
    }

    pub fn no_device(msg: impl Into<String>) -> Self {
        Self::new(libc::ENODEV, msg)
    }

    pub fn no_entry(msg: impl Into<String>) -> Self {
        Self::new(libc::ENOENT, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(libc::ECANCELED, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(libc::EIO, msg)
    }

    pub fn exists(msg: impl Into<String>) -> Self {
        Self::new(libc::EEXIST, msg)
    }

    pub fn timed_out(msg: impl Into<String>) -> Self {
        Self::new(libc::ETIMEDOUT, msg)
    }

    pub fn proto(msg: impl Into<String>) -> Self {
        Self::new(libc::EPROTONOSUPPORT, msg)
    }
}

impl fmt::Display for CodedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.msg, errno_name(self.code))
    }
}

impl From<io::Error> for CodedError {
    fn from(err: io::Error) -> Self {
        Self::from_io(err, "I/O error")
    }
}

/// Symbolic name of an errno value, for log readability.
pub fn errno_name(code: i32) -> &'static str {
    match code {
        libc::EAGAIN => "EAGAIN",
        libc::EBUSY => "EBUSY",
        libc::ECANCELED => "ECANCELED",
        libc::EEXIST => "EEXIST",
        libc::EINTR => "EINTR",
        libc::EINVAL => "EINVAL",
        libc::EIO => "EIO",
        libc::ENODATA => "ENODATA",
        libc::ENODEV => "ENODEV",
        libc::ENOENT => "ENOENT",
        libc::ENOMEM => "ENOMEM",
        libc::ENOSPC => "ENOSPC",
        libc::ENXIO => "ENXIO",
        libc::EPERM => "EPERM",
        libc::EPROTONOSUPPORT => "EPROTONOSUPPORT",
        libc::EACCES => "EACCES",
        libc::ETIMEDOUT => "ETIMEDOUT",
        _ => "errno",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_is_normalized_positive() {
        let err = CodedError::new(-libc::EBUSY, "drive in use");
        assert_eq!(err.code(), libc::EBUSY);
    }

    #[test]
    fn test_display_includes_errno_name() {
        let err = CodedError::no_space("medium is full");
        let text = err.to_string();
        assert!(text.contains("medium is full"));
        assert!(text.contains("ENOSPC"));
    }

    #[test]
    fn test_from_io_preserves_os_code() {
        let io_err = io::Error::from_raw_os_error(libc::ENOENT);
        let err = CodedError::from_io(io_err, "open lock file");
        assert_eq!(err.code(), libc::ENOENT);
        assert!(err.message().contains("open lock file"));
    }

    #[test]
    fn test_from_io_without_os_code_maps_to_eio() {
        let io_err = io::Error::new(io::ErrorKind::Other, "opaque");
        let err = CodedError::from(io_err);
        assert_eq!(err.code(), libc::EIO);
    }

    #[test]
    fn test_with_code_keeps_message() {
        let err = CodedError::invalid("drive to drive move").with_code(libc::EBUSY);
        assert_eq!(err.code(), libc::EBUSY);
        assert_eq!(err.message(), "drive to drive move");
    }
}
