//! `flock(2)` backend
//!
//! `flock` locks belong to the open file description, so two descriptors
//! opened on the same path contend even inside one process. The lock is
//! dropped by the kernel when the last descriptor closes, including when the
//! holder crashes.

use std::{
    fs::{OpenOptions, Permissions},
    io,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::Path,
};

use fs2::FileExt;

use super::{is_contended, Attempt, Backend, LockHandle};

/// Native advisory lock for Unix-like systems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixBackend {
    mode: u32,
}

impl UnixBackend {
    /// Lock files created by this backend get exactly `mode`, whatever the umask.
    pub const fn new(mode: u32) -> Self {
        Self { mode }
    }

    /// Permission bits applied to the lock file
    pub const fn mode(&self) -> u32 {
        self.mode
    }
}

impl Backend for UnixBackend {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn try_acquire(&self, path: &Path) -> io::Result<Attempt> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(self.mode)
            .open(path)?;

        // open(2) masks the mode with the umask; chmod does not.
        // A file owned by another user keeps its permissions.
        match file.set_permissions(Permissions::from_mode(self.mode)) {
            Err(e) if e.kind() != io::ErrorKind::PermissionDenied => return Err(e),
            _ => {}
        }

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Attempt::Acquired(LockHandle::new(file, path))),
            Err(e) if is_contended(&e) => Ok(Attempt::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn release(&self, handle: LockHandle) -> io::Result<()> {
        // Closing the descriptor drops the lock regardless of the unlock result.
        match FileExt::unlock(handle.file()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_descriptor_would_block() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.lock");
        let backend = UnixBackend::new(0o644);

        let first = backend.try_acquire(&path)?;
        assert!(matches!(first, Attempt::Acquired(_)));
        assert!(matches!(backend.try_acquire(&path)?, Attempt::WouldBlock));

        if let Attempt::Acquired(handle) = first {
            backend.release(handle)?;
        }
        let again = backend.try_acquire(&path)?;
        assert!(matches!(again, Attempt::Acquired(_)));
        Ok(())
    }

    #[test]
    fn test_lock_file_is_left_behind() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.lock");
        let backend = UnixBackend::new(0o644);

        if let Attempt::Acquired(handle) = backend.try_acquire(&path)? {
            backend.release(handle)?;
        }
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn test_release_after_external_delete() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.lock");
        let backend = UnixBackend::new(0o644);

        let Attempt::Acquired(handle) = backend.try_acquire(&path)? else {
            return Err(io::Error::other("fresh lock file should be acquirable"));
        };
        std::fs::remove_file(&path)?;
        backend.release(handle)?;
        Ok(())
    }

    #[test]
    fn test_mode_ignores_umask() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.lock");
        let backend = UnixBackend::new(0o666);
        assert_eq!(backend.mode(), 0o666);

        let Attempt::Acquired(handle) = backend.try_acquire(&path)? else {
            return Err(io::Error::other("fresh lock file should be acquirable"));
        };
        let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
        backend.release(handle)?;
        assert_eq!(mode, 0o666);
        Ok(())
    }

    #[test]
    fn test_closing_unwrapped_file_drops_the_lock() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.lock");
        let backend = UnixBackend::new(0o644);

        let Attempt::Acquired(handle) = backend.try_acquire(&path)? else {
            return Err(io::Error::other("fresh lock file should be acquirable"));
        };
        assert_eq!(handle.path(), path.as_path());
        let file = handle.into_file();
        assert!(matches!(backend.try_acquire(&path)?, Attempt::WouldBlock));

        drop(file);
        assert!(matches!(backend.try_acquire(&path)?, Attempt::Acquired(_)));
        Ok(())
    }
}
