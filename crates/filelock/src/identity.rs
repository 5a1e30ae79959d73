//! Lock identity
//!
//! A lock is identified by its path. Distinct spellings of the same path
//! (`a/./b.lock`, `a/x/../b.lock`, relative vs absolute) normalize to one
//! [`LockPath`] so in-process bookkeeping treats them as the same lock.
//!
//! Normalization is purely lexical: the filesystem is never consulted and
//! symlinks are not resolved. Cross-process exclusion is the OS's job.

use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

/// Canonical identity of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockPath {
    path: PathBuf,
}

impl LockPath {
    /// Normalize a caller-supplied path.
    ///
    /// Relative paths are anchored at the current directory. A path that cannot
    /// be made absolute (the empty path) is kept verbatim so that the open at
    /// acquire time reports the OS error.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let raw = path.as_ref();
        let path = std::path::absolute(raw)
            .map(|abs| normalize(&abs))
            .unwrap_or_else(|_| raw.to_path_buf());
        Self { path }
    }

    /// The normalized path
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// Consume into the normalized path
    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }
}

/// Drop `.` components and fold `..` into their parent.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .fold(PathBuf::new(), |mut acc, component| {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    // `..` at the root stays at the root
                    acc.pop();
                }
                other => acc.push(other.as_os_str()),
            }
            acc
        })
}

impl AsRef<Path> for LockPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl From<&Path> for LockPath {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for LockPath {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&str> for LockPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl fmt::Display for LockPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_components_are_removed() {
        let base = std::env::temp_dir();
        let a = LockPath::new(base.join("a/./b.lock"));
        let b = LockPath::new(base.join("a/b.lock"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_parent_components_are_folded() {
        let base = std::env::temp_dir();
        let a = LockPath::new(base.join("a/x/../b.lock"));
        let b = LockPath::new(base.join("a/b.lock"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_relative_is_anchored_at_cwd() -> std::io::Result<()> {
        let cwd = std::env::current_dir()?;
        assert_eq!(LockPath::new("c.lock").as_path(), cwd.join("c.lock"));
        Ok(())
    }

    #[test]
    fn test_into_path_buf_yields_normalized_path() {
        let base = std::env::temp_dir();
        let path = LockPath::new(base.join("a/./b.lock")).into_path_buf();
        assert_eq!(path, normalize(&base.join("a/b.lock")));
    }

    #[test]
    fn test_empty_path_is_kept_verbatim() {
        assert_eq!(LockPath::new("").as_path(), Path::new(""));
    }

    #[test]
    fn test_distinct_files_stay_distinct() {
        let base = std::env::temp_dir();
        assert_ne!(LockPath::new(base.join("a.lock")), LockPath::new(base.join("b.lock")));
    }
}
