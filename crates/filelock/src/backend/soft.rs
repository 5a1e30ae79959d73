//! Existence-based backend
//!
//! Holding the lock means having created the file; releasing means deleting
//! it. There is no OS involvement beyond `O_CREAT | O_EXCL`, which makes this
//! the weakest backend: a holder that dies without releasing leaves the file
//! behind and every later acquirer sees "would block" until someone deletes
//! it by hand. Pre-existing files are never treated as stale.
//!
//! Use it only where the filesystem has no advisory locking.

use std::{fs, io, path::Path};

use super::{ensure_writable, Attempt, Backend, LockHandle};

/// Lock by exclusive file creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftBackend {
    mode: u32,
}

impl SoftBackend {
    /// `mode` is handed to `open(2)` and is therefore subject to the umask.
    pub const fn new(mode: u32) -> Self {
        Self { mode }
    }

    /// Permission bits requested for the lock file
    pub const fn mode(&self) -> u32 {
        self.mode
    }

    #[cfg(unix)]
    fn create(&self, path: &Path) -> io::Result<fs::File> {
        use std::os::unix::fs::OpenOptionsExt;

        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(self.mode)
            .open(path)
    }

    #[cfg(not(unix))]
    fn create(&self, path: &Path) -> io::Result<fs::File> {
        fs::OpenOptions::new().write(true).create_new(true).open(path)
    }
}

impl Backend for SoftBackend {
    fn name(&self) -> &'static str {
        "soft"
    }

    fn try_acquire(&self, path: &Path) -> io::Result<Attempt> {
        ensure_writable(path)?;

        match self.create(path) {
            Ok(file) => Ok(Attempt::Acquired(LockHandle::new(file, path))),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Attempt::WouldBlock),
            // Windows refuses to recreate a file that is pending deletion
            Err(e) if cfg!(windows) && e.kind() == io::ErrorKind::PermissionDenied => {
                Ok(Attempt::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    fn release(&self, handle: LockHandle) -> io::Result<()> {
        let path = handle.path().to_path_buf();
        // Close before unlinking; Windows cannot delete an open file.
        drop(handle);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_file_would_block() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.lock");
        let backend = SoftBackend::new(0o644);
        assert_eq!(backend.mode(), 0o644);

        let first = backend.try_acquire(&path)?;
        assert!(matches!(first, Attempt::Acquired(_)));
        assert!(path.exists());
        assert!(matches!(backend.try_acquire(&path)?, Attempt::WouldBlock));

        if let Attempt::Acquired(handle) = first {
            backend.release(handle)?;
        }
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_stale_file_is_never_broken() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stale.lock");
        fs::write(&path, b"")?;

        let backend = SoftBackend::new(0o644);
        assert!(matches!(backend.try_acquire(&path)?, Attempt::WouldBlock));
        assert!(matches!(backend.try_acquire(&path)?, Attempt::WouldBlock));
        Ok(())
    }

    #[test]
    fn test_release_tolerates_external_delete() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.lock");
        let backend = SoftBackend::new(0o644);

        let Attempt::Acquired(handle) = backend.try_acquire(&path)? else {
            return Err(io::Error::other("fresh lock file should be acquirable"));
        };
        fs::remove_file(&path)?;
        backend.release(handle)?;
        Ok(())
    }

    #[test]
    fn test_directory_is_fatal_not_contended() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = SoftBackend::new(0o644);
        assert!(backend.try_acquire(dir.path()).is_err());
        Ok(())
    }
}
