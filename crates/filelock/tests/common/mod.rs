//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::{
    io::{self, Write},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use filelock::{select_backend, Attempt, Backend, BackendKind, Error, LockHandle, Result};

/// Fresh scratch directory, removed when dropped
pub fn scratch() -> Result<tempfile::TempDir> {
    tempfile::tempdir().map_err(|e| Error::platform("tempdir", e))
}

/// Wraps a real backend and counts the calls that reach it.
#[derive(Debug)]
pub struct CountingBackend {
    inner: Arc<dyn Backend>,
    acquires: AtomicUsize,
    releases: AtomicUsize,
}

impl CountingBackend {
    pub fn new(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            inner: select_backend(kind, 0o644),
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl Backend for CountingBackend {
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

#[derive(Debug, Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a DEBUG subscriber installed on this thread and return what it logged.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = SharedBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let value = tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer
        .0
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    (value, String::from_utf8_lossy(&bytes).into_owned())
}
