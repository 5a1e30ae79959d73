//! Thread-blocking file lock
//!
//! [`FileLock`] drives the acquisition protocol from an ordinary thread,
//! sleeping between attempts. Clones share one instance: acquiring through
//! any clone is reentrant for all of them, and the lock is released when the
//! outermost guard goes away.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use filelock::{AcquireOptions, FileLock};
//!
//! fn main() -> filelock::Result<()> {
//!     let lock = FileLock::new("/tmp/build.lock");
//!     let options = AcquireOptions::new().with_timeout(Duration::from_secs(5));
//!     let _guard = lock.acquire_with(&options)?;
//!     // critical section
//!     Ok(())
//! }
//! ```

use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    backend::{select_backend, Backend, BackendKind},
    config::{AcquireOptions, LockConfig, LockTimeout},
    identity::LockPath,
    protocol::{LockCore, LockGuard},
    Error, Result,
};

/// Advisory file lock for threaded code
#[derive(Debug, Clone)]
pub struct FileLock {
    core: Arc<LockCore>,
    defaults: AcquireOptions,
}

impl FileLock {
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

    /// Lock driven by a caller-supplied backend
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

    /// Process-unique id, as it appears in logs
    pub fn id(&self) -> u64 {
        self.core.id()
    }

    pub fn backend_name(&self) -> &'static str {
        self.core.backend_name()
    }

    /// Default timeout used by [`FileLock::acquire`]
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

    /// Outstanding acquisitions on this instance
    pub fn lock_counter(&self) -> usize {
        self.core.depth()
    }

    /// Acquire with this lock's default options.
    pub fn acquire(&self) -> Result<LockGuard> {
        self.acquire_with(&self.defaults)
    }

    /// Single attempt; fails with [`Error::Timeout`] if held elsewhere.
    pub fn try_acquire(&self) -> Result<LockGuard> {
        self.acquire_with(&self.defaults.with_blocking(false))
    }

    /// Acquire, retrying every `poll_interval` until `timeout`.
    ///
    /// Only the calling thread sleeps; the instance is free for other threads
    /// while it does.
    pub fn acquire_with(&self, options: &AcquireOptions) -> Result<LockGuard> {
        let timeout = options.effective_timeout();
        let poll_interval = options.effective_poll_interval();
        let start = Instant::now();
        let mut announced = false;
        loop {
            if let Some(guard) = self.core.try_enter(&mut announced)? {
                return Ok(guard);
            }

            let elapsed = start.elapsed();
            if timeout.is_expired(elapsed) {
                tracing::debug!("Timeout on acquiring lock {} on {}", self.id(), self.identity());
                return Err(Error::timeout(self.path()));
            }

            let pause = timeout
                .remaining(elapsed)
                .map_or(poll_interval, |left| left.min(poll_interval));
            tracing::debug!(
                "Lock {} not acquired on {}, waiting {} seconds ...",
                self.id(),
                self.identity(),
                poll_interval.as_secs_f64()
            );
            std::thread::sleep(pause.max(Duration::from_micros(1)));
        }
    }

    /// Drop one acquisition level without a guard.
    pub fn release(&self) -> Result<()> {
        self.core.release(false)
    }

    /// Unlock regardless of depth. Outstanding guards become no-ops.
    pub fn force_release(&self) -> Result<()> {
        self.core.release(true)
    }

    /// Run `f` while holding the lock.
    pub fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.acquire()?;
        f()
    }
}
