//! `LockFileEx` backend

use std::{fs::OpenOptions, io, path::Path};

use fs2::FileExt;

use super::{ensure_writable, is_contended, Attempt, Backend, LockHandle};

/// Native advisory lock for Windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowsBackend;

impl WindowsBackend {
    /// `LockFileEx` has no notion of permission bits, so there is no mode.
    pub const fn new() -> Self {
        Self
    }
}

impl Backend for WindowsBackend {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn try_acquire(&self, path: &Path) -> io::Result<Attempt> {
        // A read-only file fails the open with the same error as a file
        // pending deletion, so tell them apart first.
        ensure_writable(path)?;

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return Ok(Attempt::WouldBlock),
            Err(e) => return Err(e),
        };

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Attempt::Acquired(LockHandle::new(file, path))),
            Err(e) if is_contended(&e) => Ok(Attempt::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn release(&self, handle: LockHandle) -> io::Result<()> {
        match FileExt::unlock(handle.file()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
