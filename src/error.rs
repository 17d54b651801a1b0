//! Error types for buffer registration, mapping and cache sync.

use rustix::io::Errno;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Result type alias using the crate's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for gralloc operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Handle failed structural validation (bad magic, impossible fields).
    #[error("invalid buffer handle: {0}")]
    InvalidHandle(String),

    /// Caller passed an argument the operation cannot use.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A memory backend (subsystem, device node) could not be opened.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Mapping a buffer into this process failed.
    #[error("could not map {backing} buffer (fd {fd}): {source}")]
    MappingFailed {
        /// Backing kind that was being mapped.
        backing: &'static str,
        /// File descriptor the mapping was attempted on.
        fd: RawFd,
        /// Underlying system error.
        source: Errno,
    },

    /// The backend reference or mapping could not be established.
    #[error("buffer registration failed: {0}")]
    RegistrationFailed(String),

    /// Backend/operation combination has no implementation.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A cache-control request was rejected.
    #[error("cache flush failed: {0}")]
    FlushFailed(String),

    /// The deferred-release worker could not be started or has gone away.
    #[error("release worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] Errno),
}

impl Error {
    /// Negative errno status for callers that speak the C loader convention.
    pub fn errno(&self) -> i32 {
        let errno = match self {
            Error::InvalidHandle(_) | Error::InvalidArgument(_) => Errno::INVAL,
            Error::BackendUnavailable(_) => Errno::NODEV,
            Error::MappingFailed { source, .. } => *source,
            Error::RegistrationFailed(_) => Errno::INVAL,
            Error::NotSupported(_) => Errno::NOSYS,
            Error::FlushFailed(_) => Errno::IO,
            Error::WorkerUnavailable(_) => Errno::AGAIN,
            Error::Io(e) => e.raw_os_error().map(Errno::from_raw_os_error).unwrap_or(Errno::IO),
            Error::System(errno) => *errno,
        };
        -errno.raw_os_error()
    }

    /// True for failures the caller may resolve by retrying registration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_) | Error::WorkerUnavailable(_))
    }
}
