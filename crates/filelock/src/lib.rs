//! # filelock
//!
//! Advisory, cross-process mutual exclusion through lock files.
//!
//! - [`FileLock`] blocks the calling thread between attempts.
//! - [`AsyncFileLock`] suspends the tokio task between attempts and bounds the
//!   whole acquire call with a [`Deadline`].
//!
//! Both are reentrant per instance (clones share the instance), thread-safe,
//! and hand out [`LockGuard`]s that release on every exit path.
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()` / `expect()` / `panic!()` outside tests
//! - No `unsafe`: OS locking goes through `fs2`
//!
//! ## Backends
//!
//! The platform primitive is chosen once per lock by [`select_backend`]:
//! `flock` on Unix, `LockFileEx` on Windows, or the weaker [`SoftBackend`]
//! (exclusive file creation) when asked for. Correctness across processes is
//! entirely the OS's; this crate adds reentrancy, timeouts and in-process
//! exclusion between separate instances on the same path.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use filelock::{AcquireOptions, AsyncFileLock, Error};
//!
//! #[tokio::main]
//! async fn main() -> filelock::Result<()> {
//!     let lock = AsyncFileLock::new("/tmp/deploy.lock");
//!     let options = AcquireOptions::new().with_timeout(Duration::from_secs(10));
//!     match lock.acquire_with(&options).await {
//!         Ok(_guard) => { /* critical section */ }
//!         Err(Error::Timeout { path }) => eprintln!("{} is busy", path.display()),
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod blocking;
pub mod config;
pub mod cooperative;
pub mod deadline;
mod error;
pub mod identity;
pub mod protocol;
pub mod registry;

pub use backend::{select_backend, Attempt, Backend, BackendKind, LockHandle, SoftBackend};
#[cfg(unix)]
pub use backend::UnixBackend;
#[cfg(windows)]
pub use backend::WindowsBackend;
pub use blocking::FileLock;
pub use config::{AcquireOptions, LockConfig, LockTimeout};
pub use cooperative::AsyncFileLock;
pub use deadline::{Clock, Deadline, Phase};
pub use error::{Error, Result};
pub use identity::LockPath;
pub use protocol::LockGuard;
