//! Buffer - one tracked memory region in the registry.
//!
//! A [`Buffer`] holds the bookkeeping the manager needs for one payload:
//! - Size, known even while the content lives on disk
//! - Pin count for reference counting
//! - Where the content currently is (memory, deferred, dump file)
//! - Last access tick for LRU ordering
//!
//! All fields are guarded by the manager's registry lock. The bytes live
//! in a separate per-buffer slot so lock holders never touch the registry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::BufferId;
use crate::storage::DumpHandle;

/// Shared storage for the live bytes of one buffer.
pub(crate) type Slot = Arc<RwLock<Vec<u8>>>;

/// Whether a buffer's content is in memory or on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpState {
    InMemory,
    Dumped,
}

impl fmt::Display for DumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpState::InMemory => f.write_str("in memory"),
            DumpState::Dumped => f.write_str("dumped"),
        }
    }
}

/// Per-buffer lock state.
///
/// `Shared` and `Exclusive` never follow each other directly; every
/// transition between them passes through `Unlocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    /// Held by this many read locks.
    Shared(u32),
    Exclusive,
}

/// Where dumped content can be read back from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Backing {
    /// A file written by the dump store.
    File(DumpHandle),
    /// A raw file adopted from the caller; never deleted by the manager.
    External(PathBuf),
    /// Never materialized; restores as zeros.
    Zeroed,
}

/// Location of a buffer's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Content {
    /// Bytes live in the slot.
    Resident,
    /// Lazily allocated: bytes are reserved but not yet materialized.
    Deferred,
    /// Content lives in the backing source; the slot is empty.
    Dumped(Backing),
}

/// A buffer registered with the manager.
pub struct Buffer {
    id: BufferId,
    size: usize,
    pub(crate) content: Content,
    pin_count: u32,
    readers: u32,
    writer: bool,
    last_access: u64,
    pub(crate) in_transition: bool,
    pub(crate) slot: Slot,
}

impl Buffer {
    pub(crate) fn new(
        id: BufferId,
        size: usize,
        content: Content,
        data: Vec<u8>,
        tick: u64,
    ) -> Self {
        Self {
            id,
            size,
            content,
            pin_count: 0,
            readers: 0,
            writer: false,
            last_access: tick,
            in_transition: false,
            slot: Arc::new(RwLock::new(data)),
        }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size in bytes, whether in memory or dumped.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    /// Deferred buffers count as in memory: their bytes are reserved.
    #[inline]
    pub fn dump_state(&self) -> DumpState {
        match self.content {
            Content::Resident | Content::Deferred => DumpState::InMemory,
            Content::Dumped(_) => DumpState::Dumped,
        }
    }

    #[inline]
    pub fn is_dumped(&self) -> bool {
        self.dump_state() == DumpState::Dumped
    }

    /// True once the bytes actually exist in memory.
    #[inline]
    pub fn is_materialized(&self) -> bool {
        self.content == Content::Resident
    }

    // ========================================================================
    // Pin count operations
    // ========================================================================

    /// Increment the pin count. Returns the new pin count.
    ///
    /// # Panics
    /// Panics if the buffer is dumped.
    #[inline]
    pub(crate) fn pin(&mut self) -> u32 {
        assert!(!self.is_dumped(), "pinned a dumped buffer");
        self.pin_count += 1;
        self.pin_count
    }

    /// Decrement the pin count. Returns the new pin count.
    ///
    /// # Panics
    /// Panics if pin count is already 0.
    #[inline]
    pub(crate) fn unpin(&mut self) -> u32 {
        assert!(self.pin_count > 0, "pin count underflow");
        self.pin_count -= 1;
        self.pin_count
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    // ========================================================================
    // Lock state
    // ========================================================================

    pub(crate) fn mark_held(&mut self, exclusive: bool) {
        if exclusive {
            assert!(self.readers == 0 && !self.writer, "exclusive lock over a held lock");
            self.writer = true;
        } else {
            assert!(!self.writer, "shared lock over an exclusive lock");
            self.readers += 1;
        }
    }

    pub(crate) fn mark_released(&mut self, exclusive: bool) {
        if exclusive {
            assert!(self.writer, "released an exclusive lock that was not held");
            self.writer = false;
        } else {
            assert!(self.readers > 0, "released a shared lock that was not held");
            self.readers -= 1;
        }
    }

    pub fn lock_state(&self) -> LockState {
        if self.writer {
            LockState::Exclusive
        } else if self.readers > 0 {
            LockState::Shared(self.readers)
        } else {
            LockState::Unlocked
        }
    }

    // ========================================================================
    // Access tracking and eviction
    // ========================================================================

    /// Logical tick of the last lock or allocation.
    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    #[inline]
    pub(crate) fn touch(&mut self, tick: u64) {
        self.last_access = tick;
    }

    /// True while a dump, restore or materialization is running.
    #[inline]
    pub fn is_in_transition(&self) -> bool {
        self.in_transition
    }

    /// Check if the buffer can be dumped right now.
    #[inline]
    pub fn is_evictable(&self) -> bool {
        !self.is_pinned() && !self.is_dumped() && !self.in_transition && self.size > 0
    }

    /// Exchange size, content and live bytes with `other`.
    ///
    /// Identity, pins and access history stay with each entry. Dump handles
    /// are re-tagged so they keep naming the buffer that now owns them.
    pub(crate) fn swap_content(&mut self, other: &mut Buffer) {
        std::mem::swap(&mut self.size, &mut other.size);
        std::mem::swap(&mut self.content, &mut other.content);
        std::mem::swap(&mut self.slot, &mut other.slot);

        for buffer in [self, other] {
            if let Content::Dumped(Backing::File(handle)) = &mut buffer.content {
                *handle = DumpHandle::new(buffer.id, handle.path().to_path_buf(), handle.len());
            }
        }
    }

    /// Path of the backing file, if the content is on disk.
    pub fn dump_path(&self) -> Option<&Path> {
        match &self.content {
            Content::Dumped(Backing::File(handle)) => Some(handle.path()),
            Content::Dumped(Backing::External(path)) => Some(path),
            _ => None,
        }
    }

    /// Point-in-time copy of this entry.
    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            id: self.id,
            size: self.size,
            dump_state: self.dump_state(),
            materialized: self.is_materialized(),
            pin_count: self.pin_count,
            lock_state: self.lock_state(),
            last_access: self.last_access,
            dump_path: self.dump_path().map(Path::to_path_buf),
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("content", &self.content)
            .field("pin_count", &self.pin_count)
            .field("lock_state", &self.lock_state())
            .field("last_access", &self.last_access)
            .field("in_transition", &self.in_transition)
            .finish()
    }
}

/// A point-in-time snapshot of one registry entry.
///
/// Unlike [`Buffer`], this is detached from the registry and can be kept,
/// printed and compared freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub id: BufferId,
    pub size: usize,
    pub dump_state: DumpState,
    pub materialized: bool,
    pub pin_count: u32,
    pub lock_state: LockState,
    pub last_access: u64,
    pub dump_path: Option<PathBuf>,
}
