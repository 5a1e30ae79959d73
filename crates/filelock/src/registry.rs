//! Process-wide registry of claimed lock identities
//!
//! Some advisory primitives (POSIX `fcntl` record locks in particular) are
//! re-entrant per process: a second descriptor opened by the same process on
//! the same file "succeeds" even though another lock instance already owns it.
//! Reentrancy belongs to a lock instance, not to the process, so every instance
//! claims its identity here before it calls into its backend. A second
//! instance on the same path sees the claim and reports "would block".

use std::{
    collections::HashSet,
    sync::{LazyLock, Mutex, PoisonError},
};

use crate::identity::LockPath;

static CLAIMED: LazyLock<Mutex<HashSet<LockPath>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Claim `path` for one instance. Returns `false` if another instance holds it.
pub(crate) fn claim(path: &LockPath) -> bool {
    CLAIMED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(path.clone())
}

/// Drop a claim made by [`claim`]. Unknown paths are ignored.
pub(crate) fn unclaim(path: &LockPath) {
    CLAIMED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(path);
}

/// Whether any instance in this process currently owns `path`.
pub fn is_claimed(path: &LockPath) -> bool {
    CLAIMED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(path)
}
