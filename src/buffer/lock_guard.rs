//! RAII guards for buffer access.
//!
//! These guards provide safe access to the bytes of a managed buffer:
//! - [`ReadLock`] - Shared read access (multiple allowed)
//! - [`WriteLock`] - Exclusive write access
//!
//! Both guards pin the buffer for their whole life, so it cannot be dumped
//! underneath them, and unpin it when dropped.

use std::ops::{Deref, DerefMut};

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock};

use crate::common::{BufferId, Result};

use super::buffer_manager::BufferManager;

type ReadData = ArcRwLockReadGuard<RawRwLock, Vec<u8>>;
type WriteData = ArcRwLockWriteGuard<RawRwLock, Vec<u8>>;

/// Guard for read-only buffer access.
///
/// Multiple `ReadLock`s can exist for the same buffer simultaneously.
/// The buffer is automatically unpinned when the guard is dropped.
///
/// # Example
/// ```
/// # use interchange_mem::{BufferManager, ManagerConfig};
/// # let manager = BufferManager::new(ManagerConfig::default()).unwrap();
/// # let id = manager.allocate(16).unwrap();
/// let lock = manager.read_lock(id).unwrap();
/// assert_eq!(lock.len(), 16); // Deref to &[u8]
/// // lock drops here, buffer unpinned
/// ```
pub struct ReadLock<'a> {
    /// Reference back to the manager for unpin on drop.
    manager: &'a BufferManager,
    id: BufferId,
    /// `None` once released.
    data: Option<ReadData>,
}

impl<'a> ReadLock<'a> {
    /// Called by `BufferManager::read_lock()`.
    pub(crate) fn new(manager: &'a BufferManager, id: BufferId, data: ReadData) -> Self {
        Self {
            manager,
            id,
            data: Some(data),
        }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Release the lock early. Safe to call more than once.
    ///
    /// Dereferencing the guard afterwards panics.
    pub fn drop_guard(&mut self) {
        if let Some(data) = self.data.take() {
            self.manager.mark_released(self.id, false);
            drop(data);
            self.manager.unpin(self.id);
        }
    }
}

impl Deref for ReadLock<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match &self.data {
            Some(data) => data.as_slice(),
            None => panic!("{} accessed after its lock was released", self.id),
        }
    }
}

impl Drop for ReadLock<'_> {
    fn drop(&mut self) {
        self.drop_guard();
    }
}

/// Guard for exclusive write access to a buffer.
///
/// Only one `WriteLock` can exist for a buffer at a time, and never
/// alongside a [`ReadLock`].
///
/// # Example
/// ```
/// # use interchange_mem::{BufferManager, ManagerConfig};
/// # let manager = BufferManager::new(ManagerConfig::default()).unwrap();
/// # let id = manager.allocate(16).unwrap();
/// let mut lock = manager.write_lock(id).unwrap();
/// lock[0] = 0xFF; // DerefMut to &mut [u8]
/// lock.resize(32).unwrap();
/// assert_eq!(lock.len(), 32);
/// ```
pub struct WriteLock<'a> {
    /// Reference back to the manager for unpin on drop.
    manager: &'a BufferManager,
    id: BufferId,
    /// `None` once released.
    data: Option<WriteData>,
}

impl<'a> WriteLock<'a> {
    /// Called by `BufferManager::write_lock()`.
    pub(crate) fn new(manager: &'a BufferManager, id: BufferId, data: WriteData) -> Self {
        Self {
            manager,
            id,
            data: Some(data),
        }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Resize the buffer, zero-filling any new bytes.
    ///
    /// Growth counts against the memory limit and may make the dump policy
    /// evict other buffers. This one stays pinned throughout.
    ///
    /// # Errors
    /// - `Error::OutOfMemory` if the growth cannot be satisfied; the buffer
    ///   keeps its old size
    ///
    /// # Panics
    /// Panics if the lock was already released.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        let id = self.id;
        let data = match &mut self.data {
            Some(data) => data,
            None => panic!("{} resized after its lock was released", id),
        };
        self.manager.resize_held(id, data, new_size)
    }

    /// Release the lock early. Safe to call more than once.
    ///
    /// Dereferencing the guard afterwards panics.
    pub fn drop_guard(&mut self) {
        if let Some(data) = self.data.take() {
            self.manager.mark_released(self.id, true);
            drop(data);
            self.manager.unpin(self.id);
        }
    }
}

impl Deref for WriteLock<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match &self.data {
            Some(data) => data.as_slice(),
            None => panic!("{} accessed after its lock was released", self.id),
        }
    }
}

impl DerefMut for WriteLock<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        let id = self.id;
        match &mut self.data {
            Some(data) => data.as_mut_slice(),
            None => panic!("{} accessed after its lock was released", id),
        }
    }
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        self.drop_guard();
    }
}
