//! Configuration for the buffer manager.
//!
//! Holds the crate-wide constants plus the knobs a host application sets at
//! startup: [`ManagerConfig`], [`LoadingMode`] and [`LockWait`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::common::{Error, Result};

/// One kibibyte.
pub const KIB: usize = 1024;

/// One mebibyte.
pub const MIB: usize = 1024 * KIB;

/// One gibibyte.
pub const GIB: usize = 1024 * MIB;

/// Magic bytes at the start of every dump file.
pub const DUMP_MAGIC: [u8; 8] = *b"IXMDUMP1";

/// File extension used for dump files.
pub const DUMP_EXTENSION: &str = "dump";

/// When buffer content is materialized in memory.
///
/// Configured once at startup from a string (`"lazy"` or `"direct"`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LoadingMode {
    /// Memory is resident as soon as allocate/adopt logically occur.
    #[default]
    Direct,
    /// Materialization and reload of adopted files wait for the first lock.
    Lazy,
}

impl LoadingMode {
    /// Name as accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadingMode::Direct => "direct",
            LoadingMode::Lazy => "lazy",
        }
    }
}

impl FromStr for LoadingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(LoadingMode::Direct),
            "lazy" => Ok(LoadingMode::Lazy),
            other => Err(Error::Configuration(format!(
                "unknown loading mode '{}', expected 'lazy' or 'direct'",
                other
            ))),
        }
    }
}

impl fmt::Display for LoadingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a write lock behaves when the buffer is already locked.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Return [`Error::Busy`] immediately.
    #[default]
    FailFast,
    /// Wait up to the given duration, then return [`Error::Busy`].
    Timeout(Duration),
    /// Wait until exclusive access is granted.
    Block,
}

/// Startup configuration of a [`BufferManager`].
///
/// # Example
/// ```
/// use interchange_mem::common::config::{LoadingMode, ManagerConfig, MIB};
///
/// let config = ManagerConfig::default()
///     .with_memory_limit(512 * MIB)
///     .with_loading_mode(LoadingMode::Lazy);
/// assert_eq!(config.memory_limit, Some(512 * MIB));
/// ```
///
/// [`BufferManager`]: crate::buffer::BufferManager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Hard cap on in-memory bytes. `None` means only the system allocator limits us.
    pub memory_limit: Option<usize>,

    /// Initial loading mode.
    pub loading_mode: LoadingMode,

    /// Write lock behaviour under contention.
    pub lock_wait: LockWait,

    /// Consult the dump policy whenever a pin count drops to zero.
    ///
    /// When false, the policy only runs on allocation, reallocation,
    /// restore and policy changes.
    pub evaluate_on_unlock: bool,

    /// Directory for dump files. `None` creates a private temp directory.
    pub dump_dir: Option<PathBuf>,
}

impl ManagerConfig {
    /// Default configuration: no limit, direct loading, fail-fast write
    /// locks, policy evaluated on unlock, private temp directory.
    pub fn new() -> Self {
        Self {
            memory_limit: None,
            loading_mode: LoadingMode::Direct,
            lock_wait: LockWait::FailFast,
            evaluate_on_unlock: true,
            dump_dir: None,
        }
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn with_loading_mode(mut self, mode: LoadingMode) -> Self {
        self.loading_mode = mode;
        self
    }

    pub fn with_lock_wait(mut self, wait: LockWait) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn with_evaluate_on_unlock(mut self, enabled: bool) -> Self {
        self.evaluate_on_unlock = enabled;
        self
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a human-readable byte size such as `"10MB"`, `"512 KiB"` or `"1B"`.
///
/// Units are binary: `K`/`KB`/`KiB` = 1024, `M`/`MB`/`MiB` = 1024², and so on.
/// A bare number is a byte count. Negative or fractional values are rejected.
pub fn parse_byte_size(input: &str) -> Result<usize> {
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    if digits.is_empty() {
        return Err(Error::Configuration(format!(
            "invalid byte size '{}'",
            input
        )));
    }

    let value: usize = digits
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid byte size '{}'", input)))?;

    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        other => {
            return Err(Error::Configuration(format!(
                "unknown size unit '{}' in '{}'",
                other, input
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Configuration(format!("byte size '{}' overflows", input)))
}
