//! Task-suspending file lock for tokio
//!
//! [`AsyncFileLock`] runs the same protocol as [`crate::FileLock`], but waits
//! between attempts by suspending the task. The whole attempt sequence runs
//! inside one [`Deadline`], so the caller's timeout bounds the acquire call
//! as a unit rather than each attempt.
//!
//! Backend attempts are plain non-blocking syscalls executed on the task.
//! There is no await point between a successful attempt and the guard being
//! handed back, so dropping the acquire future (or cancelling it through a
//! token) either leaves the instance untouched or returns a live guard.

use std::{future::Future, path::Path, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    backend::{select_backend, Backend, BackendKind},
    config::{AcquireOptions, LockConfig, LockTimeout},
    deadline::{Clock, Deadline},
    identity::LockPath,
    protocol::{LockCore, LockGuard},
    Error, Result,
};

/// Advisory file lock for async code
#[derive(Debug, Clone)]
pub struct AsyncFileLock {
    core: Arc<LockCore>,
    defaults: AcquireOptions,
}

impl AsyncFileLock {
    /// Native lock with default settings
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_config(path, &LockConfig::default())
    }

    /// Existence-based lock, for filesystems without advisory locking
    pub fn soft(path: impl AsRef<Path>) -> Self {
        Self::with_config(path, &LockConfig::default().with_backend(BackendKind::Soft))
    }

    pub fn with_config(path: impl AsRef<Path>, config: &LockConfig) -> Self {
        Self::with_backend(path, select_backend(config.backend, config.mode), config)
    }

    pub fn with_backend(
        path: impl AsRef<Path>,
        backend: Arc<dyn Backend>,
        config: &LockConfig,
    ) -> Self {
        Self {
            core: Arc::new(LockCore::new(
                path.as_ref().to_path_buf(),
                backend,
                config.create_parent_dirs,
            )),
            defaults: config.acquire_options(),
        }
    }

    pub fn path(&self) -> &Path {
        self.core.path()
    }

    pub fn identity(&self) -> &LockPath {
        self.core.identity()
    }

    pub fn id(&self) -> u64 {
        self.core.id()
    }

    pub fn backend_name(&self) -> &'static str {
        self.core.backend_name()
    }

    pub fn timeout(&self) -> LockTimeout {
        self.defaults.timeout
    }

    pub fn set_timeout(&mut self, timeout: impl Into<LockTimeout>) {
        self.defaults.timeout = timeout.into();
    }

    pub fn options(&self) -> &AcquireOptions {
        &self.defaults
    }

    pub fn is_locked(&self) -> bool {
        self.core.is_locked()
    }

    pub fn lock_counter(&self) -> usize {
        self.core.depth()
    }

    pub async fn acquire(&self) -> Result<LockGuard> {
        self.acquire_with(&self.defaults).await
    }

    pub async fn try_acquire(&self) -> Result<LockGuard> {
        self.acquire_with(&self.defaults.with_blocking(false)).await
    }

    /// Acquire within `options.timeout`, yielding to the scheduler between attempts.
    pub async fn acquire_with(&self, options: &AcquireOptions) -> Result<LockGuard> {
        let deadline = Deadline::after(&Clock::current()?, options.timeout.duration());
        self.acquire_within(deadline, options).await
    }

    /// Like [`AsyncFileLock::acquire_with`], but also gives up with
    /// [`Error::Cancelled`] once `cancel` is triggered.
    pub async fn acquire_with_cancel(
        &self,
        options: &AcquireOptions,
        cancel: &CancellationToken,
    ) -> Result<LockGuard> {
        let deadline =
            Deadline::after(&Clock::current()?, options.timeout.duration()).with_parent(cancel);
        self.acquire_within(deadline, options).await
    }

    async fn acquire_within(&self, deadline: Deadline, options: &AcquireOptions) -> Result<LockGuard> {
        deadline.enter()?;
        let outcome = self.poll_until_acquired(options, &deadline.token()).await;

        match deadline.exit(matches!(outcome, Ok(None))) {
            Err(Error::Elapsed) => {
                tracing::debug!("Timeout on acquiring lock {} on {}", self.id(), self.identity());
                Err(Error::timeout(self.path()))
            }
            Err(e) => Err(e),
            Ok(()) => outcome?.ok_or(Error::Cancelled),
        }
    }

    /// `Ok(None)` means the token was cancelled while waiting.
    async fn poll_until_acquired(
        &self,
        options: &AcquireOptions,
        token: &CancellationToken,
    ) -> Result<Option<LockGuard>> {
        let poll_interval = options.effective_poll_interval();
        let mut announced = false;
        loop {
            if let Some(guard) = self.core.try_enter(&mut announced)? {
                return Ok(Some(guard));
            }
            if !options.blocking {
                tracing::debug!("Timeout on acquiring lock {} on {}", self.id(), self.identity());
                return Err(Error::timeout(self.path()));
            }
            if token.is_cancelled() {
                return Ok(None);
            }

            tracing::debug!(
                "Lock {} not acquired on {}, waiting {} seconds ...",
                self.id(),
                self.identity(),
                poll_interval.as_secs_f64()
            );
            tokio::select! {
                biased;
                () = token.cancelled() => return Ok(None),
                () = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Drop one acquisition level without a guard.
    pub fn release(&self) -> Result<()> {
        self.core.release(false)
    }

    pub fn force_release(&self) -> Result<()> {
        self.core.release(true)
    }

    /// Run `f` while holding the lock.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.acquire().await?;
        f().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn scratch() -> Result<tempfile::TempDir> {
        tempfile::tempdir().map_err(|e| Error::platform("tempdir", e))
    }

    #[tokio::test]
    async fn test_nested_acquire() -> Result<()> {
        let dir = scratch()?;
        let lock = AsyncFileLock::new(dir.path().join("a"));

        let outer = lock.acquire().await?;
        let inner = lock.acquire().await?;
        assert_eq!(lock.lock_counter(), 2);
        drop(inner);
        assert!(lock.is_locked());
        drop(outer);
        assert!(!lock.is_locked());
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_timeout_on_free_lock_succeeds() -> Result<()> {
        let dir = scratch()?;
        let lock = AsyncFileLock::new(dir.path().join("a"));

        let options = AcquireOptions::new().with_timeout(Duration::ZERO);
        let guard = lock.acquire_with(&options).await?;
        assert!(guard.is_locked());
        Ok(())
    }

    #[tokio::test]
    async fn test_with_lock_runs_future_under_lock() -> Result<()> {
        let dir = scratch()?;
        let lock = AsyncFileLock::new(dir.path().join("a"));

        let depth = lock.with_lock(|| async { Ok(lock.lock_counter()) }).await?;
        assert_eq!(depth, 1);
        assert!(!lock.is_locked());
        Ok(())
    }
}
