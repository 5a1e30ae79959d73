//! Error types for filelock
//!
//! - **Timeout**: a bounded acquire gave up (recoverable)
//! - **Platform / NotImplemented**: the OS refused an open/lock/unlock (fatal, never retried)
//! - **InvalidState / Elapsed / Cancelled**: deadline bookkeeping and cooperative cancellation
//! - **InvalidConfig**: configuration parse or validation failures

use std::{io, path::PathBuf};

use thiserror::Error;

/// Core error type for lock operations
#[derive(Debug, Error)]
pub enum Error {
    /// The lock could not be acquired before the caller's timeout
    #[error("The file lock '{}' could not be acquired.", path.display())]
    Timeout {
        /// Identity of the contended lock
        path: PathBuf,
    },

    /// A deadline operation was called out of order, or no scheduler was available
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The OS failed an operation with something other than "would block"
    #[error("Platform error on '{}': {source}", path.display())]
    Platform {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The filesystem does not support advisory locking
    #[error("File locking is not implemented for '{}': {source}", path.display())]
    NotImplemented {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The deadline fired while the scoped work was running
    #[error("Deadline elapsed")]
    Elapsed,

    /// The cooperative work was cancelled by something other than its own deadline
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Classify an OS error raised while operating on `path`.
    ///
    /// `Unsupported` (ENOSYS from the lock syscall) becomes [`Error::NotImplemented`],
    /// everything else is a [`Error::Platform`] error carrying the source untouched.
    pub fn platform(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::Unsupported {
            Self::NotImplemented { path, source }
        } else {
            Self::Platform { path, source }
        }
    }

    /// Create a timeout error for the given lock identity.
    pub fn timeout(path: impl Into<PathBuf>) -> Self {
        Self::Timeout { path: path.into() }
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Whether the caller may reasonably try again.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Elapsed | Self::Cancelled)
    }

    /// The underlying OS error, if any.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::Platform { source, .. } | Self::NotImplemented { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type alias for lock operations
pub type Result<T> = std::result::Result<T, Error>;
