//! interchange-mem - Out-of-core buffer management with runtime-swappable dump policies.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        interchange-mem                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   owners: allocate / reallocate / free, ReadLock / WriteLock    │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │      Buffer Manager (buffer/)  [Runtime Swappable]      │   │
//! │  │   ┌─────────────────────────────────────────────────┐   │   │
//! │  │   │  Dump Policies: Never | Always | Barrier | Valve │   │   │
//! │  │   │            (hot-swappable at runtime)            │   │   │
//! │  │   └─────────────────────────────────────────────────┘   │   │
//! │  │      BufferManager + Buffer + Lock guards + Stats        │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │           Storage Layer (storage/)                       │   │
//! │  │      DumpStore + FileDumpStore (checksummed files)       │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (BufferId, Error, config)
//! - [`buffer`] - Buffer manager, lock guards and dump policies
//! - [`storage`] - Dump files
//!
//! # Quick Start
//! ```
//! use std::sync::Arc;
//! use interchange_mem::buffer::policy::ValveDump;
//! use interchange_mem::common::config::MIB;
//! use interchange_mem::{BufferManager, DumpState, ManagerConfig};
//!
//! let manager = BufferManager::new(ManagerConfig::default()).unwrap();
//! manager.set_dump_policy(Arc::new(ValveDump::new(8 * MIB, 2 * MIB).unwrap()));
//!
//! let id = manager.allocate(MIB).unwrap();
//! manager.write_lock(id).unwrap().fill(0x11);
//!
//! manager.dump_buffer(id).unwrap();
//! assert_eq!(manager.dump_state(id), Some(DumpState::Dumped));
//!
//! // Locking restores the content before returning
//! assert!(manager.read_lock(id).unwrap().iter().all(|&b| b == 0x11));
//! manager.free(id).unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod storage;

// Re-export commonly used items at crate root for convenience
pub use common::config::{LoadingMode, LockWait, ManagerConfig};
pub use common::{BufferId, Error, Result};

pub use buffer::policy::{AlwaysDump, BarrierDump, DumpPolicy, NeverDump, ValveDump};
pub use buffer::{
    Buffer, BufferInfo, BufferManager, BufferManagerStats, DumpState, LockState, MemoryStats,
    ReadLock, StatsSnapshot, WriteLock,
};
pub use storage::{DumpStore, FileDumpStore};
