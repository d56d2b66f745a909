//! Buffer management.
//!
//! The buffer layer tracks every large allocation, dumps unpinned buffers
//! to disk under memory pressure and restores them when they are locked
//! again.
//!
//! # Components
//! - [`BufferManager`] - The registry and arbiter
//! - [`Buffer`] - One registry entry: size, pins, dump state
//! - [`ReadLock`] / [`WriteLock`] - RAII guards for buffer access
//! - [`BufferManagerStats`] - Counters
//! - [`policy`] - Dump policy implementations

#[allow(clippy::module_inception)]
mod buffer;
mod buffer_manager;
mod lock_guard;
pub mod policy;
mod stats;

pub use buffer::{Buffer, BufferInfo, DumpState, LockState};
pub use buffer_manager::BufferManager;
pub use lock_guard::{ReadLock, WriteLock};
pub use stats::{BufferManagerStats, MemoryStats, StatsSnapshot};
