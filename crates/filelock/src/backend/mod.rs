//! Platform backends
//!
//! A backend is the narrow capability the acquisition protocol drives:
//! one non-blocking exclusive attempt, and the teardown of a handle it
//! produced. Everything about retrying, timeouts and reentrancy lives in
//! [`crate::protocol`], so a backend never sleeps and never counts.
//!
//! | backend | primitive | guarantee |
//! |---|---|---|
//! | [`UnixBackend`] | `flock(2)` advisory lock | released by the OS when the holder dies |
//! | `WindowsBackend` | `LockFileEx` byte-range lock | released by the OS when the holder dies |
//! | [`SoftBackend`] | exclusive create of the file | **none**: a crashed holder leaves a stale file |

mod soft;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use std::{
    fmt,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

pub use soft::SoftBackend;
#[cfg(unix)]
pub use unix::UnixBackend;
#[cfg(windows)]
pub use windows::WindowsBackend;

use crate::{Error, Result};

/// An open OS handle bound to a lock path, owned by exactly one lock instance
#[derive(Debug)]
pub struct LockHandle {
    file: File,
    path: PathBuf,
}

impl LockHandle {
    /// Wrap a file a backend has just locked
    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
        }
    }

    /// The locked file
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Path the handle was opened on
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give up the wrapper, keeping the file open
    pub fn into_file(self) -> File {
        self.file
    }
}

/// Outcome of a single non-blocking attempt
#[derive(Debug)]
pub enum Attempt {
    /// The lock is ours; the handle must eventually go back through [`Backend::release`]
    Acquired(LockHandle),
    /// Someone else holds the lock right now
    WouldBlock,
}

/// The capability set every platform variant provides
///
/// Any `Err` returned from `try_acquire` is fatal to the current acquire call;
/// contention must be reported as [`Attempt::WouldBlock`], never as an error.
pub trait Backend: fmt::Debug + Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Open (creating if absent) `path` and try once to lock it exclusively.
    fn try_acquire(&self, path: &Path) -> io::Result<Attempt>;

    /// Unlock and close `handle`.
    ///
    /// A file deleted behind the holder's back is not an error.
    fn release(&self, handle: LockHandle) -> io::Result<()>;
}

/// Which family of backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// The platform's advisory lock (`flock` / `LockFileEx`)
    #[default]
    Native,
    /// File-existence lock; weaker, see [`SoftBackend`]
    Soft,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "soft" => Ok(Self::Soft),
            _ => Err(Error::invalid_config(format!(
                "Invalid backend: {s}. Must be one of: native, soft"
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Soft => write!(f, "soft"),
        }
    }
}

/// Pick the backend for this platform.
///
/// `mode` is the permission set applied to newly created lock files where the
/// platform supports it. Runs once when a lock is constructed; there is no
/// global backend.
pub fn select_backend(kind: BackendKind, mode: u32) -> Arc<dyn Backend> {
    match kind {
        BackendKind::Soft => Arc::new(SoftBackend::new(mode)),
        BackendKind::Native => native_backend(mode),
    }
}

#[cfg(unix)]
fn native_backend(mode: u32) -> Arc<dyn Backend> {
    Arc::new(UnixBackend::new(mode))
}

#[cfg(windows)]
fn native_backend(_mode: u32) -> Arc<dyn Backend> {
    Arc::new(WindowsBackend::new())
}

#[cfg(not(any(unix, windows)))]
fn native_backend(mode: u32) -> Arc<dyn Backend> {
    tracing::warn!("only soft file lock is available");
    Arc::new(SoftBackend::new(mode))
}

/// Whether an error from a lock syscall means "held by someone else".
///
/// fs2 reports contention as `EWOULDBLOCK` on Unix and `ERROR_LOCK_VIOLATION`
/// on Windows; neither maps to `ErrorKind::WouldBlock` on every platform.
pub(crate) fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || (err.raw_os_error().is_some()
            && err.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}

/// Refuse lock paths that can never be opened for writing.
///
/// Existence-based locks would otherwise report a read-only file or a
/// directory as "held" forever.
pub(crate) fn ensure_writable(path: &Path) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Err(io::Error::other(format!(
            "Is a directory: '{}'",
            path.display()
        ))),
        Ok(meta) if meta.permissions().readonly() => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("Permission denied: '{}'", path.display()),
        )),
        _ => Ok(()),
    }
}
