//! Integration tests for the buffer manager.
//!
//! These tests exercise concurrent lock holders, dumps and restores from
//! several threads at once.

use interchange_mem::buffer::policy::{AlwaysDump, BarrierDump};
use interchange_mem::common::config::KIB;
use interchange_mem::{
    BufferId, BufferManager, DumpState, Error, LockState, LockWait, ManagerConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn create_manager(config: ManagerConfig) -> (Arc<BufferManager>, TempDir) {
    let dir = tempdir().unwrap();
    let manager = BufferManager::new(config.with_dump_dir(dir.path())).unwrap();
    (Arc::new(manager), dir)
}

/// Two concurrent ReadLocks both succeed; a WriteLock fails `Busy` while
/// either is held and succeeds once both are released.
#[test]
fn test_concurrent_readers_block_writer() {
    let (manager, _dir) = create_manager(ManagerConfig::default());
    let id = manager.allocate(KIB).unwrap();

    let held = Arc::new(Barrier::new(3));
    let checked = Arc::new(Barrier::new(3));

    let mut handles = vec![];
    for _ in 0..2 {
        let manager = Arc::clone(&manager);
        let held = Arc::clone(&held);
        let checked = Arc::clone(&checked);
        handles.push(thread::spawn(move || {
            let lock = manager.read_lock(id).unwrap();
            held.wait();
            checked.wait();
            drop(lock);
        }));
    }

    held.wait();
    assert_eq!(manager.lock_state(id), Some(LockState::Shared(2)));
    assert!(matches!(manager.write_lock(id), Err(Error::Busy(_))));
    checked.wait();

    for handle in handles {
        handle.join().unwrap();
    }

    let lock = manager.write_lock(id).unwrap();
    assert_eq!(manager.lock_state(id), Some(LockState::Exclusive));
    drop(lock);
    assert_eq!(manager.pin_count(id), Some(0));
}

#[test]
fn test_blocking_writer_waits_for_readers() {
    let (manager, _dir) = create_manager(ManagerConfig::default().with_lock_wait(LockWait::Block));
    let id = manager.allocate(KIB).unwrap();

    let reader_done = Arc::new(AtomicBool::new(false));
    let lock = manager.read_lock(id).unwrap();

    let writer = {
        let manager = Arc::clone(&manager);
        let reader_done = Arc::clone(&reader_done);
        thread::spawn(move || {
            let mut lock = manager.write_lock(id).unwrap();
            assert!(reader_done.load(Ordering::SeqCst));
            lock[0] = 0x77;
        })
    };

    thread::sleep(Duration::from_millis(50));
    reader_done.store(true, Ordering::SeqCst);
    drop(lock);

    writer.join().unwrap();
    assert_eq!(manager.read_lock(id).unwrap()[0], 0x77);
}

/// A writer parked behind a reader must not hold up a second reader.
#[test]
fn test_second_reader_passes_queued_writer() {
    let (manager, _dir) = create_manager(ManagerConfig::default().with_lock_wait(LockWait::Block));
    let id = manager.allocate(KIB).unwrap();

    let first = manager.read_lock(id).unwrap();
    let writer = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let mut lock = manager.write_lock(id).unwrap();
            lock[0] = 1;
        })
    };
    // Give the writer time to park on the slot
    thread::sleep(Duration::from_millis(100));

    let (tx, rx) = mpsc::channel();
    let reader = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let lock = manager.read_lock(id).unwrap();
            tx.send(lock.len()).unwrap();
        })
    };
    let granted = rx.recv_timeout(Duration::from_secs(5));
    assert_eq!(granted, Ok(KIB));
    reader.join().unwrap();

    // Same thread, second shared lock while the writer still waits
    let second = manager.read_lock(id).unwrap();
    assert_eq!(manager.lock_state(id), Some(LockState::Shared(2)));
    drop(second);
    drop(first);

    writer.join().unwrap();
    assert_eq!(manager.read_lock(id).unwrap()[0], 1);
    assert_eq!(manager.pin_count(id), Some(0));
}

#[test]
fn test_timed_writer_gives_up() {
    let config =
        ManagerConfig::default().with_lock_wait(LockWait::Timeout(Duration::from_millis(20)));
    let (manager, _dir) = create_manager(config);
    let id = manager.allocate(KIB).unwrap();

    let lock = manager.read_lock(id).unwrap();
    let contender = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || matches!(manager.write_lock(id), Err(Error::Busy(_))))
    };
    assert!(contender.join().unwrap());
    drop(lock);

    assert!(manager.write_lock(id).is_ok());
}

/// Test concurrent writers to different buffers under a policy that dumps
/// on every unlock.
#[test]
fn test_concurrent_writers_with_always_policy() {
    let (manager, _dir) = create_manager(ManagerConfig::default());
    manager.set_dump_policy(Arc::new(AlwaysDump));

    let ids: Vec<BufferId> = (0..8).map(|_| manager.allocate(4 * KIB).unwrap()).collect();

    let mut handles = vec![];
    for (i, &id) in ids.iter().enumerate() {
        let manager = Arc::clone(&manager);
        handles.push(thread::spawn(move || {
            for round in 0u8..20 {
                {
                    let mut lock = manager.write_lock(id).unwrap();
                    lock.fill(round.wrapping_mul(i as u8 + 1));
                }
                let lock = manager.read_lock(id).unwrap();
                let expected = round.wrapping_mul(i as u8 + 1);
                assert!(lock.iter().all(|&b| b == expected));
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    for &id in &ids {
        assert_eq!(manager.pin_count(id), Some(0));
        assert_eq!(manager.dump_state(id), Some(DumpState::Dumped));
    }
    let snapshot = manager.stats().snapshot();
    assert!(snapshot.dumps >= 8);
    assert_eq!(snapshot.dump_failures, 0);
}

/// Readers of one shared buffer race with a thread dumping it.
#[test]
fn test_readers_race_with_dumper() {
    let (manager, _dir) = create_manager(ManagerConfig::default());
    let id = manager.adopt((0..=255u8).cycle().take(64 * KIB).collect()).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let dumper = {
        let manager = Arc::clone(&manager);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut dumped = 0;
            // Keep going until told to stop, and until at least one dump landed
            while !stop.load(Ordering::Relaxed) || dumped == 0 {
                if manager.dump_buffer(id).unwrap() {
                    dumped += 1;
                }
                thread::yield_now();
            }
            dumped
        })
    };

    let mut readers = vec![];
    for _ in 0..4 {
        let manager = Arc::clone(&manager);
        readers.push(thread::spawn(move || {
            for _ in 0..50 {
                let lock = manager.read_lock(id).unwrap();
                assert_eq!(manager.dump_state(id), Some(DumpState::InMemory));
                assert_eq!(lock.len(), 64 * KIB);
                assert_eq!(lock[1000], (1000 % 256) as u8);
                assert_eq!(lock[64 * KIB - 1], 255);
            }
        }));
    }

    for reader in readers {
        reader.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    let dumped = dumper.join().unwrap();

    assert!(dumped >= 1);
    assert_eq!(manager.pin_count(id), Some(0));
}

/// Allocation, locking and freeing from many threads under a barrier
/// policy keep the memory accounting exact.
#[test]
fn test_memory_accounting_under_contention() {
    let (manager, _dir) = create_manager(ManagerConfig::default());
    manager.set_dump_policy(Arc::new(BarrierDump::new(32 * KIB)));

    let mut handles = vec![];
    for t in 0..4u8 {
        let manager = Arc::clone(&manager);
        handles.push(thread::spawn(move || {
            let mut mine = vec![];
            for i in 0..16u8 {
                let id = manager.allocate(KIB).unwrap();
                manager.write_lock(id).unwrap().fill(t ^ i);
                mine.push((id, t ^ i));
            }
            for &(id, byte) in &mine {
                let lock = manager.read_lock(id).unwrap();
                assert!(lock.iter().all(|&b| b == byte));
            }
            for (id, _) in mine.drain(..8) {
                manager.free(id).unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let memory = manager.memory_stats();
    let resident: usize = manager
        .buffer_infos()
        .iter()
        .filter(|info| info.dump_state == DumpState::InMemory)
        .map(|info| info.size)
        .sum();

    assert_eq!(memory.buffer_count, 32);
    assert_eq!(memory.total_managed, 32 * KIB);
    assert_eq!(memory.in_memory, resident);
    assert!(memory.in_memory <= 32 * KIB);
}
