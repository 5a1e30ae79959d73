//! Lock configuration
//!
//! # Hierarchy
//!
//! Configuration is resolved in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. A TOML file, if given and present
//! 3. Environment variables: `FILELOCK_*`
//! 4. Builder calls on [`LockConfig`] / [`AcquireOptions`]
//!
//! # Example Config
//!
//! ```toml
//! timeout = 10.0        # seconds, -1 waits forever, 0 tries once
//! poll_interval = 0.05  # seconds between attempts
//! mode = 0o644
//! backend = "native"    # or "soft"
//! create_parent_dirs = true
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{backend::BackendKind, Error, Result};

/// Default seconds between acquisition attempts
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 0.05;

/// Shortest pause between attempts; anything below is raised to this
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default permission bits of a created lock file
pub const DEFAULT_MODE: u32 = 0o644;

/// How long an acquire may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeout {
    /// Retry until the lock is free
    #[default]
    Infinite,
    /// Give up once this much time has passed; `ZERO` tries exactly once
    After(Duration),
}

impl LockTimeout {
    /// Try once, never wait
    pub const NONBLOCKING: Self = Self::After(Duration::ZERO);

    /// Interpret seconds the conventional way: negative waits forever.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs < 0.0 {
            Self::Infinite
        } else {
            Duration::try_from_secs_f64(secs).map_or(Self::Infinite, Self::After)
        }
    }

    /// The bound, if any
    pub const fn duration(&self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::After(d) => Some(*d),
        }
    }

    /// Whether `elapsed` has used up the budget
    pub fn is_expired(&self, elapsed: Duration) -> bool {
        self.duration().is_some_and(|limit| elapsed >= limit)
    }

    /// Time left after `elapsed`, `None` when unbounded
    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        self.duration().map(|limit| limit.saturating_sub(elapsed))
    }
}

impl From<Duration> for LockTimeout {
    fn from(d: Duration) -> Self {
        Self::After(d)
    }
}

impl From<Option<Duration>> for LockTimeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Self::Infinite, Self::After)
    }
}

/// Per-call acquisition parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Overall budget for the acquire call
    pub timeout: LockTimeout,
    /// Pause between attempts while the lock is held elsewhere, at least
    /// [`MIN_POLL_INTERVAL`]
    pub poll_interval: Duration,
    /// `false` makes any timeout behave like [`LockTimeout::NONBLOCKING`]
    pub blocking: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout: LockTimeout::Infinite,
            poll_interval: Duration::from_millis(50),
            blocking: true,
        }
    }
}

impl AcquireOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: impl Into<LockTimeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Seconds, negative meaning forever
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout = LockTimeout::from_secs_f64(secs);
        self
    }

    /// A zero or sub-millisecond interval is raised to [`MIN_POLL_INTERVAL`].
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    #[must_use]
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// The budget actually in force, accounting for `blocking`
    pub fn effective_timeout(&self) -> LockTimeout {
        if self.blocking {
            self.timeout
        } else {
            LockTimeout::NONBLOCKING
        }
    }

    /// The pause actually used between attempts, even if `poll_interval`
    /// was set directly below the floor
    pub fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

/// Lock construction and default-acquire settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// Default acquire timeout in seconds (`-1` forever, `0` try once)
    pub timeout: f64,
    /// Seconds between attempts
    pub poll_interval: f64,
    /// Permission bits for a newly created lock file
    pub mode: u32,
    /// Backend family
    pub backend: BackendKind,
    /// Create missing parent directories before locking
    pub create_parent_dirs: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: -1.0,
            poll_interval: DEFAULT_POLL_INTERVAL_SECS,
            mode: DEFAULT_MODE,
            backend: BackendKind::Native,
            create_parent_dirs: true,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout = secs;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, secs: f64) -> Self {
        self.poll_interval = secs;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_create_parent_dirs(mut self, create: bool) -> Self {
        self.create_parent_dirs = create;
        self
    }

    /// Parse and validate a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::invalid_config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Defaults, then `file` if it exists, then `FILELOCK_*` variables.
    pub fn load_layered(file: Option<&Path>) -> Result<Self> {
        let config = match file {
            Some(path) if path.exists() => Self::load(path)?,
            _ => Self::default(),
        };
        let config = config.apply_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FILELOCK_*` overrides from the process environment.
    pub fn apply_env_vars(self) -> Result<Self> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment, a map in tests).
    pub fn apply_env_with(self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse_f64 = |key: &str, value: String| {
            value
                .trim()
                .parse::<f64>()
                .map_err(|e| Error::invalid_config(format!("{key}={value}: {e}")))
        };

        let mut config = self;
        if let Some(value) = lookup("FILELOCK_TIMEOUT") {
            config.timeout = parse_f64("FILELOCK_TIMEOUT", value)?;
        }
        if let Some(value) = lookup("FILELOCK_POLL_INTERVAL") {
            config.poll_interval = parse_f64("FILELOCK_POLL_INTERVAL", value)?;
        }
        if let Some(value) = lookup("FILELOCK_MODE") {
            let digits = value.trim().trim_start_matches("0o");
            config.mode = u32::from_str_radix(digits, 8)
                .map_err(|e| Error::invalid_config(format!("FILELOCK_MODE={value}: {e}")))?;
        }
        if let Some(value) = lookup("FILELOCK_BACKEND") {
            config.backend = value.parse()?;
        }
        if let Some(value) = lookup("FILELOCK_CREATE_PARENT_DIRS") {
            config.create_parent_dirs = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(Error::invalid_config(format!(
                        "FILELOCK_CREATE_PARENT_DIRS={value}: expected a boolean"
                    )))
                }
            };
        }
        Ok(config)
    }

    /// Reject values no acquire could honor.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_nan() {
            return Err(Error::invalid_config("timeout must be a number"));
        }
        if !self.poll_interval.is_finite() || self.poll_interval <= 0.0 {
            return Err(Error::invalid_config(format!(
                "poll_interval must be a positive number of seconds, got {}",
                self.poll_interval
            )));
        }
        if self.mode > 0o7777 {
            return Err(Error::invalid_config(format!(
                "mode {:o} has bits outside 0o7777",
                self.mode
            )));
        }
        Ok(())
    }

    /// The default per-call options these settings describe
    pub fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            timeout: LockTimeout::from_secs_f64(self.timeout),
            poll_interval: Duration::try_from_secs_f64(self.poll_interval)
                .unwrap_or_else(|_| Duration::from_millis(50)),
            blocking: true,
        }
    }
}
