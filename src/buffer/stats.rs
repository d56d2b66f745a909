//! Buffer manager statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked by the buffer manager.
///
/// All fields are atomic for lock-free, thread-safe updates. We use
/// `Ordering::Relaxed` everywhere: counters are independent and only need
/// to be eventually consistent.
///
/// # Example
/// ```
/// use interchange_mem::BufferManagerStats;
/// use std::sync::atomic::Ordering;
///
/// let stats = BufferManagerStats::new();
/// stats.dumps.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(stats.snapshot().dumps, 1);
/// ```
#[derive(Debug)]
pub struct BufferManagerStats {
    /// Buffers registered (allocate, adopt, adopt_file).
    pub allocations: AtomicU64,

    /// Buffers freed.
    pub frees: AtomicU64,

    /// Successful dumps.
    pub dumps: AtomicU64,

    /// Dumps abandoned because the store failed.
    pub dump_failures: AtomicU64,

    /// Successful restores, including lazy materializations.
    pub restores: AtomicU64,

    /// Bytes written to the dump store.
    pub bytes_dumped: AtomicU64,

    /// Bytes read back from the dump store.
    pub bytes_restored: AtomicU64,

    /// Times the dump policy was asked for a target.
    pub policy_evaluations: AtomicU64,
}

impl BufferManagerStats {
    pub fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            dumps: AtomicU64::new(0),
            dump_failures: AtomicU64::new(0),
            restores: AtomicU64::new(0),
            bytes_dumped: AtomicU64::new(0),
            bytes_restored: AtomicU64::new(0),
            policy_evaluations: AtomicU64::new(0),
        }
    }

    /// Get a non-atomic copy for display/logging.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            dumps: self.dumps.load(Ordering::Relaxed),
            dump_failures: self.dump_failures.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            bytes_dumped: self.bytes_dumped.load(Ordering::Relaxed),
            bytes_restored: self.bytes_restored.load(Ordering::Relaxed),
            policy_evaluations: self.policy_evaluations.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.allocations.store(0, Ordering::Relaxed);
        self.frees.store(0, Ordering::Relaxed);
        self.dumps.store(0, Ordering::Relaxed);
        self.dump_failures.store(0, Ordering::Relaxed);
        self.restores.store(0, Ordering::Relaxed);
        self.bytes_dumped.store(0, Ordering::Relaxed);
        self.bytes_restored.store(0, Ordering::Relaxed);
        self.policy_evaluations.store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_dump(&self, bytes: usize) {
        self.dumps.fetch_add(1, Ordering::Relaxed);
        self.bytes_dumped.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_restore(&self, bytes: usize) {
        self.restores.fetch_add(1, Ordering::Relaxed);
        self.bytes_restored.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

impl Default for BufferManagerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of buffer manager counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub allocations: u64,
    pub frees: u64,
    pub dumps: u64,
    pub dump_failures: u64,
    pub restores: u64,
    pub bytes_dumped: u64,
    pub bytes_restored: u64,
    pub policy_evaluations: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats {{ allocations: {}, frees: {}, dumps: {} ({} bytes), ",
            self.allocations, self.frees, self.dumps, self.bytes_dumped
        )?;
        write!(
            f,
            "restores: {} ({} bytes), dump_failures: {} }}",
            self.restores, self.bytes_restored, self.dump_failures
        )
    }
}

/// Memory totals computed from the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Sum of the sizes of all registered buffers.
    pub total_managed: usize,
    /// Sum of the sizes of dumped buffers.
    pub total_dumped: usize,
    /// Bytes currently resident or reserved in memory.
    pub in_memory: usize,
    /// Number of registered buffers.
    pub buffer_count: usize,
}
