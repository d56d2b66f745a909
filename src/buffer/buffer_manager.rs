//! Buffer Manager - the registry and arbiter for out-of-core buffers.
//!
//! The [`BufferManager`] provides:
//! - Allocation of large byte buffers under an optional memory limit
//! - Pin-based reference counting through [`ReadLock`] / [`WriteLock`]
//! - Transparent dump to disk and restore on the next lock
//! - Runtime-swappable dump policies

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::buffer::buffer::{Backing, Content, Slot};
use crate::buffer::policy::{DumpPolicy, NeverDump, PolicyEvent, RegistryView};
use crate::buffer::{
    Buffer, BufferInfo, BufferManagerStats, DumpState, LockState, MemoryStats, ReadLock, WriteLock,
};
use crate::common::config::{LoadingMode, LockWait, ManagerConfig};
use crate::common::{BufferId, Error, Result};
use crate::storage::{read_raw_file, DumpStore, FileDumpStore};

/// Everything guarded by the manager-wide critical section.
struct Registry {
    buffers: HashMap<BufferId, Buffer>,

    /// Next id to hand out. Ids are never reused.
    next_id: u64,

    /// Bytes resident or reserved in memory.
    in_memory: usize,
}

impl Registry {
    fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_id: 1,
            in_memory: 0,
        }
    }

    /// Look up a buffer the caller holds a pin or a transition on.
    ///
    /// # Panics
    /// Panics if the entry is gone: `free` and `swap_buffers` refuse pinned
    /// buffers and wait out transitions.
    fn held(&mut self, id: BufferId) -> &mut Buffer {
        match self.buffers.get_mut(&id) {
            Some(buffer) => buffer,
            None => panic!("{} removed while held", id),
        }
    }
}

/// Manages a registry of buffers that may live in memory or on disk.
///
/// # Architecture
/// ```text
/// ┌──────────────────────────────────────────────────────────────┐
/// │                        BufferManager                         │
/// │  ┌────────────────────────────┐   ┌──────────────────────┐   │
/// │  │   registry: Mutex          │   │ policy: RwLock<Arc>  │   │
/// │  │ BufferId → Buffer (meta)   │   │  dyn DumpPolicy      │   │
/// │  │ in_memory bytes            │   └──────────────────────┘   │
/// │  └─────────────┬──────────────┘   ┌──────────────────────┐   │
/// │                │ slot (Arc)       │ store: DumpStore     │   │
/// │                ▼                  │  buffer-<id>-<n>.dump│   │
/// │  ┌────────────────────────────┐   └──────────────────────┘   │
/// │  │ RwLock<Vec<u8>> per buffer │◀── ReadLock / WriteLock      │
/// │  └────────────────────────────┘                              │
/// └──────────────────────────────────────────────────────────────┘
/// ```
///
/// # Thread Safety
/// - `registry`: `Mutex`, metadata only, never held across disk I/O
/// - `transition_done`: `Condvar`, wakes lockers waiting on a dump or restore
/// - `policy`: `RwLock<Arc<..>>`, replaced whole, evaluations clone the `Arc`
/// - slots: one `RwLock` per buffer, lock holders never touch the registry
/// - `stats`: No lock, all atomic counters
///
/// # Usage
/// ```
/// use std::sync::Arc;
/// use interchange_mem::buffer::policy::BarrierDump;
/// use interchange_mem::{BufferManager, ManagerConfig};
///
/// let manager = BufferManager::new(ManagerConfig::default()).unwrap();
/// manager.set_dump_policy(Arc::new(BarrierDump::new(64 * 1024)));
///
/// let id = manager.allocate(4096).unwrap();
/// {
///     let mut lock = manager.write_lock(id).unwrap();
///     lock[0] = 0xAB;
/// } // unpinned here
///
/// manager.dump_buffer(id).unwrap();
/// let lock = manager.read_lock(id).unwrap(); // restored transparently
/// assert_eq!(lock[0], 0xAB);
/// ```
pub struct BufferManager {
    registry: Mutex<Registry>,

    /// Signalled whenever a buffer leaves its transition.
    transition_done: Condvar,

    /// Active dump policy.
    policy: RwLock<Arc<dyn DumpPolicy>>,

    loading_mode: RwLock<LoadingMode>,

    /// Backing files for dumped buffers.
    store: Box<dyn DumpStore>,

    stats: BufferManagerStats,

    config: ManagerConfig,

    /// Logical clock for `last_access`.
    clock: AtomicU64,
}

impl BufferManager {
    /// Create a manager with a file-backed dump store.
    ///
    /// Dump files go to `config.dump_dir`, or to a private temp directory
    /// that is removed when the manager is dropped.
    ///
    /// # Errors
    /// I/O errors creating the dump directory.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let store = match &config.dump_dir {
            Some(dir) => FileDumpStore::in_dir(dir)?,
            None => FileDumpStore::temporary()?,
        };
        Ok(Self::with_store(config, Box::new(store)))
    }

    /// Create a manager on top of a custom dump store.
    pub fn with_store(config: ManagerConfig, store: Box<dyn DumpStore>) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            transition_done: Condvar::new(),
            policy: RwLock::new(Arc::new(NeverDump)),
            loading_mode: RwLock::new(config.loading_mode),
            store,
            stats: BufferManagerStats::new(),
            config,
            clock: AtomicU64::new(0),
        }
    }

    /// Delete every outstanding dump file and clear the registry.
    ///
    /// Taking `self` by value guarantees no lock is alive.
    ///
    /// # Errors
    /// The first I/O error hit while deleting dump files. Deletion carries
    /// on past failures.
    pub fn shutdown(self) -> Result<()> {
        self.release_all()
    }

    // ========================================================================
    // Public API: Allocate and free
    // ========================================================================

    /// Allocate a zero-filled buffer of `size` bytes.
    ///
    /// In [`LoadingMode::Direct`] the bytes are materialized right away; in
    /// [`LoadingMode::Lazy`] they are only reserved and materialized on the
    /// first lock.
    ///
    /// # Errors
    /// - `Error::OutOfMemory` if the memory limit cannot be met even after
    ///   the dump policy freed what it could, or the allocator refuses
    pub fn allocate(&self, size: usize) -> Result<BufferId> {
        let mode = self.loading_mode();
        self.reserve(size)?;

        let (content, data) = match mode {
            LoadingMode::Direct => match self.zeroed(size) {
                Ok(data) => (Content::Resident, data),
                Err(e) => {
                    self.unreserve(size);
                    return Err(e);
                }
            },
            LoadingMode::Lazy => (Content::Deferred, Vec::new()),
        };

        let id = self.register(size, content, data);
        debug!("allocated {} ({} bytes, {})", id, size, mode);

        self.run_policy(PolicyEvent::Allocated(id));
        Ok(id)
    }

    /// Take ownership of existing bytes as a new buffer.
    ///
    /// # Errors
    /// - `Error::OutOfMemory` if the bytes do not fit under the memory limit
    pub fn adopt(&self, bytes: Vec<u8>) -> Result<BufferId> {
        let size = bytes.len();
        self.reserve(size)?;

        let id = self.register(size, Content::Resident, bytes);
        debug!("adopted {} ({} bytes)", id, size);

        self.run_policy(PolicyEvent::Allocated(id));
        Ok(id)
    }

    /// Register a buffer whose content is an existing raw file of `size` bytes.
    ///
    /// The file is read as-is and never deleted by the manager. In
    /// [`LoadingMode::Direct`] it is loaded before returning; in
    /// [`LoadingMode::Lazy`] the buffer stays dumped until the first lock.
    ///
    /// # Errors
    /// - `Error::CorruptedDump` if a direct load finds the file missing or
    ///   of the wrong size; nothing is registered in that case
    /// - `Error::OutOfMemory` if a direct load does not fit
    pub fn adopt_file<P: AsRef<Path>>(&self, path: P, size: usize) -> Result<BufferId> {
        let path = path.as_ref().to_path_buf();
        let content = Content::Dumped(Backing::External(path.clone()));
        let id = self.register(size, content, Vec::new());
        debug!("adopted {} from {} ({} bytes)", id, path.display(), size);

        if self.loading_mode() == LoadingMode::Direct {
            if let Err(e) = self.bring_in(id, false) {
                self.registry.lock().buffers.remove(&id);
                self.stats.allocations.fetch_sub(1, Ordering::Relaxed);
                return Err(e);
            }
            self.run_policy(PolicyEvent::Allocated(id));
        }
        Ok(id)
    }

    /// Resize a buffer, zero-filling new bytes.
    ///
    /// Acquires a [`WriteLock`] for the duration of the call.
    ///
    /// # Errors
    /// - `Error::Busy` if another lock is held, per the configured [`LockWait`]
    /// - `Error::OutOfMemory` if growth cannot be satisfied
    pub fn reallocate(&self, id: BufferId, new_size: usize) -> Result<()> {
        let mut lock = self.write_lock(id)?;
        lock.resize(new_size)
    }

    /// Remove a buffer and delete its dump file.
    ///
    /// Waits for a running dump or restore of this buffer to finish.
    ///
    /// # Errors
    /// - `Error::InUse` if the buffer is pinned
    ///
    /// # Panics
    /// Panics if `id` is not registered (double free).
    pub fn free(&self, id: BufferId) -> Result<()> {
        let mut guard = self.registry.lock();
        let removed = loop {
            let reg = &mut *guard;
            let buffer = match reg.buffers.get(&id) {
                Some(buffer) => buffer,
                None => panic!("double free of {}", id),
            };
            if buffer.is_pinned() {
                return Err(Error::InUse {
                    id,
                    pin_count: buffer.pin_count(),
                });
            }
            if buffer.is_in_transition() {
                self.transition_done.wait(&mut guard);
                continue;
            }

            let removed = match reg.buffers.remove(&id) {
                Some(buffer) => buffer,
                None => panic!("double free of {}", id),
            };
            if !removed.is_dumped() {
                reg.in_memory -= removed.size();
            }
            break removed;
        };
        drop(guard);

        if let Content::Dumped(Backing::File(handle)) = &removed.content {
            if let Err(e) = self.store.delete(handle) {
                warn!("failed to delete dump file {}: {}", handle.path().display(), e);
            }
        }

        self.stats.frees.fetch_add(1, Ordering::Relaxed);
        debug!("freed {} ({} bytes)", id, removed.size());
        Ok(())
    }

    /// Exchange the content of two unpinned buffers.
    ///
    /// Sizes and backing files move with the content; ids stay put.
    ///
    /// # Errors
    /// - `Error::UnknownBuffer` if either id is not registered
    /// - `Error::InUse` if either buffer is pinned
    pub fn swap_buffers(&self, a: BufferId, b: BufferId) -> Result<()> {
        let mut guard = self.registry.lock();
        loop {
            let reg = &mut *guard;
            let mut busy = false;
            for id in [a, b] {
                let buffer = reg.buffers.get(&id).ok_or(Error::UnknownBuffer(id))?;
                if buffer.is_pinned() {
                    return Err(Error::InUse {
                        id,
                        pin_count: buffer.pin_count(),
                    });
                }
                busy |= buffer.is_in_transition();
            }
            if !busy {
                break;
            }
            self.transition_done.wait(&mut guard);
        }

        if a == b {
            return Ok(());
        }

        let reg = &mut *guard;
        let Some(mut first) = reg.buffers.remove(&a) else {
            return Err(Error::UnknownBuffer(a));
        };
        if let Some(second) = reg.buffers.get_mut(&b) {
            first.swap_content(second);
        }
        reg.buffers.insert(a, first);

        debug!("swapped {} and {}", a, b);
        Ok(())
    }

    // ========================================================================
    // Public API: Locks
    // ========================================================================

    /// Lock a buffer for shared reading.
    ///
    /// Restores the buffer first if it is dumped. Blocks while a
    /// [`WriteLock`] on the same buffer is held, but never queues behind a
    /// writer that is only waiting: read locks stay compatible with each
    /// other.
    ///
    /// # Errors
    /// - `Error::UnknownBuffer` if the id is not registered
    /// - `Error::CorruptedDump` if the dump cannot be read back
    /// - `Error::OutOfMemory` if the restore does not fit
    pub fn read_lock(&self, id: BufferId) -> Result<ReadLock<'_>> {
        let (slot, restored) = self.bring_in(id, true)?;
        let data = slot.read_arc_recursive();
        self.mark_held(id, false);

        if restored {
            self.run_policy(PolicyEvent::Restored(id));
        }
        Ok(ReadLock::new(self, id, data))
    }

    /// Lock a buffer for exclusive writing.
    ///
    /// Restores the buffer first if it is dumped. Contention is handled per
    /// [`ManagerConfig::lock_wait`].
    ///
    /// # Errors
    /// Same as [`read_lock`](Self::read_lock), plus `Error::Busy` if another
    /// lock is held and the configured wait gave up.
    pub fn write_lock(&self, id: BufferId) -> Result<WriteLock<'_>> {
        let (slot, restored) = self.bring_in(id, true)?;
        let data = match self.config.lock_wait {
            LockWait::FailFast => slot.try_write_arc(),
            LockWait::Timeout(timeout) => slot.try_write_arc_for(timeout),
            LockWait::Block => Some(slot.write_arc()),
        };

        let Some(data) = data else {
            self.unpin(id);
            return Err(Error::Busy(id));
        };
        self.mark_held(id, true);

        if restored {
            self.run_policy(PolicyEvent::Restored(id));
        }
        Ok(WriteLock::new(self, id, data))
    }

    // ========================================================================
    // Public API: Dump and restore
    // ========================================================================

    /// Write a buffer's content to a fresh dump file and release its memory.
    ///
    /// Returns `Ok(false)` without doing anything if the buffer is pinned,
    /// already dumped, in transition or empty.
    ///
    /// # Errors
    /// - `Error::UnknownBuffer` if the id is not registered
    /// - `Error::Io` if the dump store failed; the buffer stays in memory
    pub fn dump_buffer(&self, id: BufferId) -> Result<bool> {
        Ok(self.dump_internal(id)?.is_some())
    }

    /// Read a dumped buffer back into memory and delete its dump file.
    ///
    /// Returns `Ok(false)` if the buffer is already in memory.
    ///
    /// # Errors
    /// - `Error::UnknownBuffer` if the id is not registered
    /// - `Error::CorruptedDump` if the dump cannot be read back; the buffer
    ///   stays dumped
    /// - `Error::OutOfMemory` if the restore does not fit
    pub fn restore_buffer(&self, id: BufferId) -> Result<bool> {
        let (_, restored) = self.bring_in(id, false)?;
        if restored {
            self.run_policy(PolicyEvent::Restored(id));
        }
        Ok(restored)
    }

    // ========================================================================
    // Public API: Policy and loading mode
    // ========================================================================

    /// Replace the active dump policy and evaluate it once.
    pub fn set_dump_policy(&self, policy: Arc<dyn DumpPolicy>) {
        let name = policy.name();
        let previous = std::mem::replace(&mut *self.policy.write(), policy);
        info!("dump policy changed from {} to {}", previous.name(), name);

        self.run_policy(PolicyEvent::Refresh);
    }

    /// The active dump policy.
    pub fn dump_policy(&self) -> Arc<dyn DumpPolicy> {
        self.policy.read().clone()
    }

    pub fn loading_mode(&self) -> LoadingMode {
        *self.loading_mode.read()
    }

    /// Change the loading mode for subsequent allocations and adoptions.
    pub fn set_loading_mode(&self, mode: LoadingMode) {
        *self.loading_mode.write() = mode;
        info!("loading mode set to {}", mode);
    }

    /// Set the loading mode from its string form (`"lazy"` or `"direct"`).
    ///
    /// # Errors
    /// `Error::Configuration` for anything else; the previous mode is kept.
    pub fn configure_loading_mode(&self, value: &str) -> Result<()> {
        match value.parse::<LoadingMode>() {
            Ok(mode) => {
                self.set_loading_mode(mode);
                Ok(())
            }
            Err(e) => {
                error!("{}; keeping loading mode {}", e, self.loading_mode());
                Err(e)
            }
        }
    }

    // ========================================================================
    // Public API: Stats and info
    // ========================================================================

    /// Get buffer manager statistics.
    pub fn stats(&self) -> &BufferManagerStats {
        &self.stats
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Memory totals over the whole registry.
    pub fn memory_stats(&self) -> MemoryStats {
        let reg = self.registry.lock();
        let mut stats = MemoryStats {
            in_memory: reg.in_memory,
            buffer_count: reg.buffers.len(),
            ..MemoryStats::default()
        };
        for buffer in reg.buffers.values() {
            stats.total_managed += buffer.size();
            if buffer.is_dumped() {
                stats.total_dumped += buffer.size();
            }
        }
        stats
    }

    /// Get the number of registered buffers.
    pub fn buffer_count(&self) -> usize {
        self.registry.lock().buffers.len()
    }

    pub fn buffer_info(&self, id: BufferId) -> Option<BufferInfo> {
        self.registry.lock().buffers.get(&id).map(Buffer::info)
    }

    /// Snapshots of every registered buffer, ordered by id.
    pub fn buffer_infos(&self) -> Vec<BufferInfo> {
        let mut infos: Vec<BufferInfo> =
            self.registry.lock().buffers.values().map(Buffer::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn pin_count(&self, id: BufferId) -> Option<u32> {
        self.registry.lock().buffers.get(&id).map(Buffer::pin_count)
    }

    pub fn dump_state(&self, id: BufferId) -> Option<DumpState> {
        self.registry.lock().buffers.get(&id).map(Buffer::dump_state)
    }

    pub fn lock_state(&self, id: BufferId) -> Option<LockState> {
        self.registry.lock().buffers.get(&id).map(Buffer::lock_state)
    }

    /// Path of the file currently holding a dumped buffer's content.
    pub fn dump_path(&self, id: BufferId) -> Option<PathBuf> {
        self.registry
            .lock()
            .buffers
            .get(&id)
            .and_then(|b| b.dump_path().map(Path::to_path_buf))
    }

    /// Human-readable table of the registry.
    pub fn report(&self) -> String {
        self.to_string()
    }

    // ========================================================================
    // Internal: Called by ReadLock/WriteLock
    // ========================================================================

    /// Record the lock state before the slot guard is released.
    pub(crate) fn mark_released(&self, id: BufferId, exclusive: bool) {
        self.registry.lock().held(id).mark_released(exclusive);
    }

    /// Drop one pin. Runs the policy if this was the last one.
    ///
    /// Called after the slot guard is released, so the policy may dump the
    /// buffer right away.
    pub(crate) fn unpin(&self, id: BufferId) {
        let remaining = self.registry.lock().held(id).unpin();

        if remaining == 0 && self.config.evaluate_on_unlock {
            self.run_policy(PolicyEvent::Unlocked(id));
        }
    }

    /// Grow or shrink the bytes behind a held write lock.
    pub(crate) fn resize_held(
        &self,
        id: BufferId,
        data: &mut Vec<u8>,
        new_size: usize,
    ) -> Result<()> {
        let old_size = data.len();

        if new_size > old_size {
            let delta = new_size - old_size;
            self.reserve(delta)?;
            if data.try_reserve_exact(delta).is_err() {
                self.unreserve(delta);
                return Err(self.out_of_memory(delta, self.in_memory_bytes()));
            }
            data.resize(new_size, 0);
            self.registry.lock().held(id).set_size(new_size);

            debug!("grew {} from {} to {} bytes", id, old_size, new_size);
            self.run_policy(PolicyEvent::Reallocated(id));
        } else if new_size < old_size {
            data.truncate(new_size);
            data.shrink_to_fit();
            {
                let mut reg = self.registry.lock();
                reg.held(id).set_size(new_size);
                reg.in_memory -= old_size - new_size;
            }
            debug!("shrank {} from {} to {} bytes", id, old_size, new_size);
        }

        Ok(())
    }

    // ========================================================================
    // Internal: Registry bookkeeping
    // ========================================================================

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn register(&self, size: usize, content: Content, data: Vec<u8>) -> BufferId {
        let mut reg = self.registry.lock();
        let id = BufferId::new(reg.next_id);
        reg.next_id += 1;
        reg.buffers
            .insert(id, Buffer::new(id, size, content, data, self.tick()));

        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        id
    }

    fn mark_held(&self, id: BufferId, exclusive: bool) {
        self.registry.lock().held(id).mark_held(exclusive);
    }

    fn in_memory_bytes(&self) -> usize {
        self.registry.lock().in_memory
    }

    fn out_of_memory(&self, requested: usize, in_memory: usize) -> Error {
        Error::OutOfMemory {
            requested,
            in_memory,
            limit: self.config.memory_limit,
        }
    }

    /// A zero-filled vector, failing instead of aborting if the allocator refuses.
    fn zeroed(&self, size: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        if data.try_reserve_exact(size).is_err() {
            return Err(self.out_of_memory(size, self.in_memory_bytes()));
        }
        data.resize(size, 0);
        Ok(data)
    }

    /// Bytes that must be freed before `bytes` more fit under the limit.
    ///
    /// `None` if the total would overflow.
    fn shortfall(&self, in_memory: usize, bytes: usize) -> Option<usize> {
        let total = in_memory.checked_add(bytes)?;
        Some(match self.config.memory_limit {
            Some(limit) => total.saturating_sub(limit),
            None => 0,
        })
    }

    /// Account for `bytes` more in memory, asking the policy for room once.
    fn reserve(&self, bytes: usize) -> Result<()> {
        let mut made_room = false;
        loop {
            let mut reg = self.registry.lock();
            match self.shortfall(reg.in_memory, bytes) {
                Some(0) => {
                    reg.in_memory += bytes;
                    return Ok(());
                }
                Some(excess) if !made_room => {
                    drop(reg);
                    self.make_room(excess);
                    made_room = true;
                }
                _ => return Err(self.out_of_memory(bytes, reg.in_memory)),
            }
        }
    }

    fn unreserve(&self, bytes: usize) {
        self.registry.lock().in_memory -= bytes;
    }

    fn release_all(&self) -> Result<()> {
        let buffers: Vec<Buffer> = {
            let mut reg = self.registry.lock();
            reg.in_memory = 0;
            reg.buffers.drain().map(|(_, buffer)| buffer).collect()
        };
        if buffers.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        let mut deleted = 0;
        for buffer in &buffers {
            if let Content::Dumped(Backing::File(handle)) = &buffer.content {
                match self.store.delete(handle) {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        warn!("failed to delete dump file {}: {}", handle.path().display(), e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        info!(
            "buffer manager released {} buffers, deleted {} dump files",
            buffers.len(),
            deleted
        );
        match first_error {
            Some(e) => Err(Error::Io(e)),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Internal: Restore and materialize
    // ========================================================================

    /// Make sure a buffer's bytes are in memory, optionally pinning it.
    ///
    /// Returns the slot and whether this call brought the content in. The
    /// pin is taken in the same critical section that commits the restore,
    /// so a pinned buffer is never observed dumped.
    fn bring_in(&self, id: BufferId, pin: bool) -> Result<(Slot, bool)> {
        let mut made_room = false;
        let mut guard = self.registry.lock();

        let (size, backing) = loop {
            let reg = &mut *guard;
            let buffer = reg.buffers.get_mut(&id).ok_or(Error::UnknownBuffer(id))?;

            if buffer.is_in_transition() {
                self.transition_done.wait(&mut guard);
                continue;
            }

            if buffer.is_materialized() {
                if pin {
                    buffer.pin();
                    buffer.touch(self.tick());
                }
                return Ok((Arc::clone(&buffer.slot), false));
            }

            // `None` for a deferred buffer that was never materialized.
            let backing = match &buffer.content {
                Content::Dumped(backing) => Some(backing.clone()),
                _ => None,
            };
            let size = buffer.size();

            // Deferred bytes are already accounted for.
            if backing.is_some() {
                match self.shortfall(reg.in_memory, size) {
                    Some(0) => reg.in_memory += size,
                    Some(excess) if !made_room => {
                        drop(guard);
                        self.make_room(excess);
                        made_room = true;
                        guard = self.registry.lock();
                        continue;
                    }
                    _ => return Err(self.out_of_memory(size, reg.in_memory)),
                }
            }

            reg.held(id).in_transition = true;
            break (size, backing);
        };

        let loaded = MutexGuard::unlocked(&mut guard, || -> Result<Vec<u8>> {
            let data = self.load(id, size, backing.as_ref())?;
            if let Some(Backing::File(handle)) = &backing {
                if let Err(e) = self.store.delete(handle) {
                    warn!("failed to delete dump file {}: {}", handle.path().display(), e);
                }
            }
            Ok(data)
        });

        let reg = &mut *guard;
        let buffer = reg.held(id);
        buffer.in_transition = false;
        self.transition_done.notify_all();

        match loaded {
            Ok(data) => {
                *buffer.slot.write() = data;
                buffer.content = Content::Resident;
                if pin {
                    buffer.pin();
                }
                buffer.touch(self.tick());
                let slot = Arc::clone(&buffer.slot);
                drop(guard);

                self.stats.record_restore(size);
                match backing {
                    None => debug!("materialized {} ({} bytes)", id, size),
                    Some(_) => debug!("restored {} ({} bytes)", id, size),
                }
                Ok((slot, true))
            }
            Err(e) => {
                if backing.is_some() {
                    reg.in_memory -= size;
                }
                Err(e)
            }
        }
    }

    /// Read a buffer's content from its backing source.
    fn load(&self, id: BufferId, size: usize, backing: Option<&Backing>) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        if data.try_reserve_exact(size).is_err() {
            return Err(self.out_of_memory(size, self.in_memory_bytes()));
        }

        match backing {
            None | Some(Backing::Zeroed) => data.resize(size, 0),
            Some(Backing::File(handle)) => self.store.read(handle, &mut data)?,
            Some(Backing::External(path)) => read_raw_file(id, path, size, &mut data)?,
        }

        if data.len() != size {
            return Err(Error::CorruptedDump {
                id,
                reason: format!("expected {} bytes, got {}", size, data.len()),
            });
        }
        Ok(data)
    }

    // ========================================================================
    // Internal: Dump and policy evaluation
    // ========================================================================

    /// Dump one buffer. Returns the bytes released, or `None` if it was not
    /// evictable.
    fn dump_internal(&self, id: BufferId) -> Result<Option<usize>> {
        let (slot, size) = {
            let mut guard = self.registry.lock();
            let reg = &mut *guard;
            let buffer = reg.buffers.get_mut(&id).ok_or(Error::UnknownBuffer(id))?;
            if !buffer.is_evictable() {
                return Ok(None);
            }

            let size = buffer.size();
            // Nothing to write for bytes that were never materialized.
            if buffer.content == Content::Deferred {
                buffer.content = Content::Dumped(Backing::Zeroed);
                reg.in_memory -= size;
                self.stats.record_dump(0);
                debug!("dropped reservation of {} ({} bytes)", id, size);
                return Ok(Some(size));
            }

            buffer.in_transition = true;
            (Arc::clone(&buffer.slot), size)
        };

        // Unpinned, so nobody else holds the slot.
        let written = {
            let data = slot.read();
            self.store.write(id, &data)
        };
        if written.is_ok() {
            *slot.write() = Vec::new();
        }

        let mut guard = self.registry.lock();
        let reg = &mut *guard;
        let buffer = reg.held(id);
        buffer.in_transition = false;
        self.transition_done.notify_all();

        match written {
            Ok(handle) => {
                debug!("dumped {} ({} bytes) to {}", id, size, handle.path().display());
                buffer.content = Content::Dumped(Backing::File(handle));
                reg.in_memory -= size;
                self.stats.record_dump(size);
                Ok(Some(size))
            }
            Err(e) => {
                self.stats.dump_failures.fetch_add(1, Ordering::Relaxed);
                warn!("abandoned dump of {} ({} bytes): {}", id, size, e);
                Err(Error::Io(e))
            }
        }
    }

    /// Dump candidates in order until `target` bytes are freed.
    ///
    /// Failures are logged and skipped.
    fn dump_candidates(&self, candidates: &[BufferId], target: usize) -> usize {
        let mut freed = 0usize;
        for &id in candidates {
            if freed >= target {
                break;
            }
            match self.dump_internal(id) {
                Ok(Some(bytes)) => freed = freed.saturating_add(bytes),
                Ok(None) | Err(Error::UnknownBuffer(_)) => {}
                // Already logged and counted.
                Err(_) => {}
            }
        }
        freed
    }

    /// Ask the active policy how much to free after `event`, then free it.
    fn run_policy(&self, event: PolicyEvent) {
        let policy = self.dump_policy();
        let (target, candidates) = {
            let reg = self.registry.lock();
            let view = RegistryView::new(&reg.buffers, reg.in_memory);
            self.stats.policy_evaluations.fetch_add(1, Ordering::Relaxed);

            let target = policy.target_bytes(event, &view);
            if target == 0 {
                return;
            }
            (target, policy.select_candidates(&view, target))
        };

        let freed = self.dump_candidates(&candidates, target);
        debug!(
            "{} policy freed {} bytes from {} candidates after {:?}",
            policy.name(),
            freed,
            candidates.len(),
            event
        );
    }

    /// Free at least `bytes` using the policy's candidate order.
    fn make_room(&self, bytes: usize) {
        let policy = self.dump_policy();
        let candidates = {
            let reg = self.registry.lock();
            let view = RegistryView::new(&reg.buffers, reg.in_memory);
            policy.select_candidates(&view, bytes)
        };

        let freed = self.dump_candidates(&candidates, bytes);
        debug!("made room: {} of {} bytes freed", freed, bytes);
    }
}

impl fmt::Display for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let policy = self.dump_policy();
        let memory = self.memory_stats();
        let infos = self.buffer_infos();

        write!(f, "BufferManager: policy {}", policy.name())?;
        for name in policy.param_names() {
            if let Some(value) = policy.param(name) {
                write!(f, " {}={}", name, value)?;
            }
        }
        writeln!(f, ", loading mode {}", self.loading_mode())?;
        writeln!(
            f,
            "{} buffers, {} bytes managed, {} dumped, {} in memory",
            memory.buffer_count, memory.total_managed, memory.total_dumped, memory.in_memory
        )?;

        writeln!(
            f,
            "{:>8} {:>12} {:<10} {:>5} {:<10} {:>8}",
            "id", "size", "state", "pins", "lock", "access"
        )?;
        for info in infos {
            let lock = match info.lock_state {
                LockState::Unlocked => "-".to_string(),
                LockState::Shared(n) => format!("shared({})", n),
                LockState::Exclusive => "exclusive".to_string(),
            };
            write!(
                f,
                "{:>8} {:>12} {:<10} {:>5} {:<10} {:>8}",
                info.id.0,
                info.size,
                info.dump_state.to_string(),
                info.pin_count,
                lock,
                info.last_access
            )?;
            if let Some(path) = &info.dump_path {
                write!(f, " {}", path.display())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("policy", &self.dump_policy())
            .field("loading_mode", &self.loading_mode())
            .field("memory", &self.memory_stats())
            .finish()
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            warn!("buffer manager cleanup incomplete: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::policy::{AlwaysDump, BarrierDump};
    use tempfile::TempDir;

    /// Helper to create a manager dumping into a temporary directory.
    fn create_manager(config: ManagerConfig) -> (BufferManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let manager = BufferManager::new(config.with_dump_dir(dir.path())).unwrap();
        (manager, dir)
    }

    fn fill(manager: &BufferManager, id: BufferId, byte: u8) {
        let mut lock = manager.write_lock(id).unwrap();
        lock.fill(byte);
    }

    #[test]
    fn test_allocate() {
        let (manager, _dir) = create_manager(ManagerConfig::default());

        let a = manager.allocate(128).unwrap();
        let b = manager.allocate(64).unwrap();
        assert_ne!(a, b);

        assert_eq!(manager.pin_count(a), Some(0));
        assert_eq!(manager.dump_state(a), Some(DumpState::InMemory));
        assert_eq!(manager.memory_stats().in_memory, 192);
        assert_eq!(manager.stats().snapshot().allocations, 2);
    }

    #[test]
    fn test_allocate_is_zeroed() {
        let (manager, _dir) = create_manager(ManagerConfig::default());

        let id = manager.allocate(32).unwrap();
        let lock = manager.read_lock(id).unwrap();
        assert_eq!(lock.len(), 32);
        assert!(lock.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pin_count_tracking() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(16).unwrap();

        let first = manager.read_lock(id).unwrap();
        let second = manager.read_lock(id).unwrap();
        assert_eq!(manager.pin_count(id), Some(2));
        assert_eq!(manager.lock_state(id), Some(LockState::Shared(2)));

        drop(first);
        assert_eq!(manager.pin_count(id), Some(1));
        drop(second);
        assert_eq!(manager.pin_count(id), Some(0));
        assert_eq!(manager.lock_state(id), Some(LockState::Unlocked));
    }

    #[test]
    fn test_dump_and_restore() {
        let (manager, dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(1024).unwrap();
        fill(&manager, id, 0x5A);

        assert!(manager.dump_buffer(id).unwrap());
        assert_eq!(manager.dump_state(id), Some(DumpState::Dumped));
        assert_eq!(manager.memory_stats().in_memory, 0);

        let path = manager.dump_path(id).unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());

        assert!(manager.restore_buffer(id).unwrap());
        assert_eq!(manager.dump_state(id), Some(DumpState::InMemory));
        assert!(!path.exists());

        let lock = manager.read_lock(id).unwrap();
        assert!(lock.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_dump_is_noop_when_pinned_or_dumped() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(64).unwrap();

        {
            let _lock = manager.read_lock(id).unwrap();
            assert!(!manager.dump_buffer(id).unwrap());
        }

        assert!(manager.dump_buffer(id).unwrap());
        assert!(!manager.dump_buffer(id).unwrap());
        assert_eq!(manager.stats().snapshot().dumps, 1);
    }

    #[test]
    fn test_restore_in_memory_is_noop() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(64).unwrap();

        assert!(!manager.restore_buffer(id).unwrap());
    }

    #[test]
    fn test_lock_restores_dumped_buffer() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(256).unwrap();
        fill(&manager, id, 7);
        manager.dump_buffer(id).unwrap();

        let lock = manager.write_lock(id).unwrap();
        assert_eq!(manager.dump_state(id), Some(DumpState::InMemory));
        assert!(lock.iter().all(|&b| b == 7));
        assert_eq!(manager.stats().snapshot().restores, 1);
    }

    #[test]
    fn test_free() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(64).unwrap();

        manager.free(id).unwrap();
        assert_eq!(manager.buffer_count(), 0);
        assert_eq!(manager.memory_stats().in_memory, 0);
        assert_eq!(manager.pin_count(id), None);
    }

    #[test]
    fn test_free_deletes_dump_file() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(64).unwrap();
        manager.dump_buffer(id).unwrap();
        let path = manager.dump_path(id).unwrap();

        manager.free(id).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_free_pinned_fails() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(64).unwrap();

        let _lock = manager.read_lock(id).unwrap();
        let result = manager.free(id);
        assert!(matches!(result, Err(Error::InUse { pin_count: 1, .. })));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(64).unwrap();

        manager.free(id).unwrap();
        let _ = manager.free(id);
    }

    #[test]
    fn test_unknown_buffer() {
        let (manager, _dir) = create_manager(ManagerConfig::default());

        let result = manager.read_lock(BufferId::new(42));
        assert!(matches!(result, Err(Error::UnknownBuffer(_))));
        assert!(matches!(
            manager.dump_buffer(BufferId::new(42)),
            Err(Error::UnknownBuffer(_))
        ));
    }

    #[test]
    fn test_write_lock_busy() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(64).unwrap();

        let read = manager.read_lock(id).unwrap();
        let result = manager.write_lock(id);
        assert!(matches!(result, Err(Error::Busy(_))));
        // A failed attempt leaves no pin behind
        assert_eq!(manager.pin_count(id), Some(1));

        drop(read);
        assert!(manager.write_lock(id).is_ok());
    }

    #[test]
    fn test_reallocate() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(4).unwrap();
        fill(&manager, id, 1);

        manager.reallocate(id, 8).unwrap();
        assert_eq!(manager.memory_stats().in_memory, 8);
        {
            let lock = manager.read_lock(id).unwrap();
            assert_eq!(&lock[..], &[1, 1, 1, 1, 0, 0, 0, 0]);
        }

        manager.reallocate(id, 2).unwrap();
        assert_eq!(manager.memory_stats().in_memory, 2);
        assert_eq!(manager.buffer_info(id).unwrap().size, 2);
    }

    #[test]
    fn test_always_policy_dumps_on_unlock() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        let id = manager.allocate(64).unwrap();
        manager.set_dump_policy(Arc::new(AlwaysDump));
        assert_eq!(manager.dump_state(id), Some(DumpState::Dumped));

        {
            let _lock = manager.read_lock(id).unwrap();
            assert_eq!(manager.dump_state(id), Some(DumpState::InMemory));
        }
        assert_eq!(manager.dump_state(id), Some(DumpState::Dumped));

        let fresh = manager.allocate(64).unwrap();
        assert_eq!(manager.dump_state(fresh), Some(DumpState::InMemory));

        assert!(manager.restore_buffer(id).unwrap());
        assert_eq!(manager.dump_state(id), Some(DumpState::InMemory));
    }

    #[test]
    fn test_unlock_evaluation_can_be_disabled() {
        let config = ManagerConfig::default().with_evaluate_on_unlock(false);
        let (manager, _dir) = create_manager(config);
        let id = manager.allocate(64).unwrap();
        manager.set_dump_policy(Arc::new(AlwaysDump));

        drop(manager.read_lock(id).unwrap());
        assert_eq!(manager.dump_state(id), Some(DumpState::InMemory));
    }

    #[test]
    fn test_barrier_on_allocate() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        manager.set_dump_policy(Arc::new(BarrierDump::new(100)));

        let a = manager.allocate(40).unwrap();
        let b = manager.allocate(40).unwrap();
        let c = manager.allocate(40).unwrap();

        assert_eq!(manager.dump_state(a), Some(DumpState::Dumped));
        assert_eq!(manager.dump_state(b), Some(DumpState::InMemory));
        assert_eq!(manager.dump_state(c), Some(DumpState::InMemory));
        assert_eq!(manager.memory_stats().in_memory, 80);
    }

    #[test]
    fn test_memory_limit_without_policy() {
        let (manager, _dir) = create_manager(ManagerConfig::default().with_memory_limit(100));

        manager.allocate(60).unwrap();
        let result = manager.allocate(60);
        assert!(matches!(
            result,
            Err(Error::OutOfMemory {
                requested: 60,
                in_memory: 60,
                limit: Some(100)
            })
        ));
        assert_eq!(manager.memory_stats().in_memory, 60);
    }

    #[test]
    fn test_lazy_allocation() {
        let (manager, _dir) =
            create_manager(ManagerConfig::default().with_loading_mode(LoadingMode::Lazy));
        let id = manager.allocate(16).unwrap();

        let info = manager.buffer_info(id).unwrap();
        assert_eq!(info.dump_state, DumpState::InMemory);
        assert!(!info.materialized);
        assert_eq!(manager.memory_stats().in_memory, 16);

        let lock = manager.read_lock(id).unwrap();
        assert_eq!(&lock[..], &[0; 16]);
        assert!(manager.buffer_info(id).unwrap().materialized);
    }

    #[test]
    fn test_lazy_dump_writes_nothing() {
        let (manager, _dir) =
            create_manager(ManagerConfig::default().with_loading_mode(LoadingMode::Lazy));
        let id = manager.allocate(16).unwrap();

        assert!(manager.dump_buffer(id).unwrap());
        assert_eq!(manager.dump_path(id), None);
        assert_eq!(manager.memory_stats().in_memory, 0);

        let lock = manager.read_lock(id).unwrap();
        assert_eq!(&lock[..], &[0; 16]);
    }

    #[test]
    fn test_configure_loading_mode() {
        let (manager, _dir) = create_manager(ManagerConfig::default());

        manager.configure_loading_mode("LAZY").unwrap();
        assert_eq!(manager.loading_mode(), LoadingMode::Lazy);

        assert!(manager.configure_loading_mode("bogus").is_err());
        assert_eq!(manager.loading_mode(), LoadingMode::Lazy);
    }

    #[test]
    fn test_report_lists_buffers() {
        let (manager, _dir) = create_manager(ManagerConfig::default());
        manager.allocate(1234).unwrap();
        manager.set_dump_policy(Arc::new(BarrierDump::new(4096)));

        let report = manager.report();
        assert!(report.contains("policy barrier barrier=4096"));
        assert!(report.contains("1234"));
        assert!(report.contains("in memory"));
    }
}
