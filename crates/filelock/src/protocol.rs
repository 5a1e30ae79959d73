//! Acquisition protocol
//!
//! [`LockCore`] is the state every lock instance owns: the reentrancy depth
//! and the OS handle, behind a mutex scoped to the instance. One call to
//! [`LockCore::try_enter`] is one step of the protocol:
//!
//! - `depth > 0`: bump the depth, no backend call;
//! - otherwise: claim the identity in-process, make one backend attempt,
//!   and on success store the handle with `depth = 1`.
//!
//! The backend always opens the path exactly as the caller spelled it; the
//! normalized [`LockPath`] is only the registry key and the name in logs.
//! Folding `..` lexically is wrong once a symlink precedes it, and which file
//! is locked must be decided by the OS.
//!
//! The retry loops in [`crate::blocking`] and [`crate::cooperative`] only
//! sleep between steps; the instance mutex is never held while they wait.
//!
//! # Invariants
//!
//! - `handle.is_some() == (depth > 0)`
//! - a failed step leaves `depth` and `handle` untouched
//! - releasing at depth 0 is a no-op and never reaches the backend

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crate::{
    backend::{Attempt, Backend, LockHandle},
    identity::LockPath,
    registry, Error, Result,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct LockState {
    depth: usize,
    handle: Option<LockHandle>,
    /// Bumped every time the lock is fully released, so guards from an
    /// earlier holding period cannot release a later one
    epoch: u64,
}

/// Per-instance lock state and the backend it drives
#[derive(Debug)]
pub(crate) struct LockCore {
    id: u64,
    /// The caller's spelling, handed to the filesystem untouched
    file: PathBuf,
    path: LockPath,
    backend: Arc<dyn Backend>,
    create_parent_dirs: bool,
    state: Mutex<LockState>,
}

impl LockCore {
    pub(crate) fn new(file: PathBuf, backend: Arc<dyn Backend>, create_parent_dirs: bool) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            path: LockPath::new(&file),
            file,
            backend,
            create_parent_dirs,
            state: Mutex::new(LockState::default()),
        }
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn path(&self) -> &Path {
        &self.file
    }

    pub(crate) fn identity(&self) -> &LockPath {
        &self.path
    }

    pub(crate) fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn depth(&self) -> usize {
        self.state().depth
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.depth() > 0
    }

    /// One step of the protocol. `Ok(None)` means "held elsewhere, try later".
    ///
    /// `announced` belongs to the caller's acquire call and is set once the
    /// first backend attempt of that call has been logged.
    ///
    /// The guard is built before the state mutex is dropped and no await
    /// point exists in here, so a successful backend acquisition always
    /// reaches the caller as a guard.
    pub(crate) fn try_enter(self: &Arc<Self>, announced: &mut bool) -> Result<Option<LockGuard>> {
        let mut state = self.state();
        if state.depth > 0 {
            state.depth += 1;
            return Ok(Some(LockGuard::new(Arc::clone(self), state.epoch)));
        }

        if !registry::claim(&self.path) {
            return Ok(None);
        }
        if !*announced {
            tracing::debug!("Attempting to acquire lock {} on {}", self.id, self.path);
            *announced = true;
        }

        match self.attempt() {
            Ok(Attempt::Acquired(handle)) => {
                state.handle = Some(handle);
                state.depth = 1;
                tracing::debug!("Lock {} acquired on {}", self.id, self.path);
                Ok(Some(LockGuard::new(Arc::clone(self), state.epoch)))
            }
            Ok(Attempt::WouldBlock) => {
                registry::unclaim(&self.path);
                Ok(None)
            }
            Err(e) => {
                registry::unclaim(&self.path);
                Err(Error::platform(&self.file, e))
            }
        }
    }

    fn attempt(&self) -> io::Result<Attempt> {
        if self.create_parent_dirs {
            if let Some(parent) = self.path().parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        self.backend.try_acquire(self.path())
    }

    /// Drop one level, or all of them with `force`.
    ///
    /// Bookkeeping changes before the handle is torn down: if the backend
    /// fails to unlock, the instance is still unlocked and the error is
    /// returned for the caller to log.
    pub(crate) fn release(&self, force: bool) -> Result<()> {
        let state = self.state();
        self.release_locked(state, force)
    }

    /// Release on behalf of a guard taken during `epoch`.
    fn release_from(&self, epoch: u64) -> Result<()> {
        let state = self.state();
        if state.epoch != epoch {
            // a forced release already ended that holding period
            return Ok(());
        }
        self.release_locked(state, false)
    }

    fn release_locked(&self, mut state: MutexGuard<'_, LockState>, force: bool) -> Result<()> {
        if state.depth == 0 {
            return Ok(());
        }
        state.depth = if force { 0 } else { state.depth - 1 };
        if state.depth > 0 {
            return Ok(());
        }

        tracing::debug!("Attempting to release lock {} on {}", self.id, self.path);
        state.epoch = state.epoch.wrapping_add(1);
        let teardown = state
            .handle
            .take()
            .map_or(Ok(()), |handle| self.backend.release(handle));
        registry::unclaim(&self.path);
        drop(state);

        match teardown {
            Ok(()) => {
                tracing::debug!("Lock {} released on {}", self.id, self.path);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "Lock {} on {} released with an unlock error: {e}",
                    self.id,
                    self.path
                );
                Err(Error::platform(&self.file, e))
            }
        }
    }
}

impl Drop for LockCore {
    fn drop(&mut self) {
        // Only reachable while locked if every guard was leaked.
        if let Err(e) = self.release(true) {
            tracing::warn!("Failed to release lock {} on drop: {e}", self.id);
        }
    }
}

/// Scoped ownership of one acquisition level
///
/// Dropping the guard releases that level. [`LockGuard::release`] does the
/// same eagerly and reports unlock errors; after it, drop does nothing.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    core: Arc<LockCore>,
    epoch: u64,
    released: bool,
}

impl LockGuard {
    fn new(core: Arc<LockCore>, epoch: u64) -> Self {
        Self {
            core,
            epoch,
            released: false,
        }
    }

    /// Release this level now. A second call is a no-op.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.core.release_from(self.epoch)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Path of the underlying lock
    pub fn path(&self) -> &Path {
        self.core.path()
    }

    /// Whether the owning instance is still locked
    pub fn is_locked(&self) -> bool {
        self.core.is_locked()
    }

    /// Depth of the owning instance
    pub fn lock_counter(&self) -> usize {
        self.core.depth()
    }

    /// Id of the owning instance
    pub fn lock_id(&self) -> u64 {
        self.core.id()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Failed to release lock '{}': {e}", self.core.path().display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::backend::SoftBackend;

    #[derive(Debug)]
    struct Counting {
        inner: SoftBackend,
        acquires: AtomicUsize,
        releases: AtomicUsize,
    }

    impl Backend for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn try_acquire(&self, path: &Path) -> io::Result<Attempt> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            self.inner.try_acquire(path)
        }

        fn release(&self, handle: LockHandle) -> io::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release(handle)
        }
    }

    fn counting_core(dir: &Path) -> (Arc<LockCore>, Arc<Counting>) {
        let backend = Arc::new(Counting {
            inner: SoftBackend::new(0o644),
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        });
        let core = Arc::new(LockCore::new(
            dir.join("core.lock"),
            Arc::clone(&backend) as Arc<dyn Backend>,
            true,
        ));
        (core, backend)
    }

    #[test]
    fn test_reentry_touches_backend_once() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::platform("tempdir", e))?;
        let (core, backend) = counting_core(dir.path());

        let guards: Vec<LockGuard> = (0..5)
            .map(|_| core.try_enter(&mut false))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(guards.len(), 5);
        assert_eq!(core.depth(), 5);
        assert!(guards.iter().all(|g| g.lock_id() == core.id()));

        drop(guards);
        assert_eq!(core.depth(), 0);
        assert_eq!(backend.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_release_at_zero_is_noop() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::platform("tempdir", e))?;
        let (core, backend) = counting_core(dir.path());

        core.release(false)?;
        core.release(true)?;
        assert_eq!(core.depth(), 0);
        assert_eq!(backend.releases.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_guard_release_twice_decrements_once() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::platform("tempdir", e))?;
        let (core, _backend) = counting_core(dir.path());

        let _outer = core.try_enter(&mut false)?;
        let mut inner = core.try_enter(&mut false)?.ok_or_else(|| Error::timeout("inner"))?;
        assert_eq!(core.depth(), 2);

        inner.release()?;
        inner.release()?;
        drop(inner);
        assert_eq!(core.depth(), 1);
        Ok(())
    }

    #[test]
    fn test_stale_guard_after_force_release() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::platform("tempdir", e))?;
        let (core, _backend) = counting_core(dir.path());

        let stale = core.try_enter(&mut false)?;
        core.release(true)?;
        let fresh = core.try_enter(&mut false)?;
        assert_eq!(core.depth(), 1);

        drop(stale);
        assert_eq!(core.depth(), 1, "stale guard must not end the new holding period");
        drop(fresh);
        assert_eq!(core.depth(), 0);
        Ok(())
    }

    #[test]
    fn test_second_instance_would_block_in_process() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::platform("tempdir", e))?;
        let (first, _) = counting_core(dir.path());
        let (second, second_backend) = counting_core(dir.path());

        let _held = first.try_enter(&mut false)?;
        assert!(second.try_enter(&mut false)?.is_none());
        assert_eq!(
            second_backend.acquires.load(Ordering::SeqCst),
            0,
            "the in-process claim answers before the backend is asked"
        );
        assert!(!second.is_locked());
        Ok(())
    }

    #[test]
    fn test_failed_attempt_leaves_state_untouched() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::platform("tempdir", e))?;
        let core = Arc::new(LockCore::new(
            dir.path().to_path_buf(),
            Arc::new(SoftBackend::new(0o644)),
            false,
        ));

        assert!(core.try_enter(&mut false).is_err());
        assert_eq!(core.depth(), 0);
        assert!(!registry::is_claimed(core.identity()));
        Ok(())
    }
}
