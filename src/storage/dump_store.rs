//! Dump store - backing files for dumped buffers.
//!
//! The [`DumpStore`] trait is the only thing the buffer manager knows about
//! the filesystem: write bytes, read them back, delete the file.
//! [`FileDumpStore`] is the default implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::TempDir;

use crate::common::config::{DUMP_EXTENSION, DUMP_MAGIC};
use crate::common::{BufferId, Error, Result};

/// Location and expected length of one dump file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpHandle {
    id: BufferId,
    path: PathBuf,
    len: usize,
}

impl DumpHandle {
    pub fn new(id: BufferId, path: PathBuf, len: usize) -> Self {
        Self { id, path, len }
    }

    /// Buffer the dump belongs to.
    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Backing store for dumped buffer content.
///
/// Implementations must be usable from many threads at once; the manager
/// calls them with its registry lock released.
pub trait DumpStore: Send + Sync {
    /// Write `data` to a fresh backing file.
    fn write(&self, id: BufferId, data: &[u8]) -> io::Result<DumpHandle>;

    /// Read the payload of `handle` into `out`.
    ///
    /// `out` arrives empty with at least `handle.len()` bytes of capacity.
    /// Any mismatch between the file and the handle is a
    /// [`Error::CorruptedDump`]; a short read must never succeed.
    fn read(&self, handle: &DumpHandle, out: &mut Vec<u8>) -> Result<()>;

    /// Delete the backing file.
    fn delete(&self, handle: &DumpHandle) -> io::Result<()>;
}

/// Size of the dump file header.
///
/// # Layout (20 bytes)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       8     magic ("IXMDUMP1")
/// 8       8     payload length (u64, little-endian)
/// 16      4     CRC32 of the payload (little-endian)
/// ```
pub const DUMP_HEADER_SIZE: usize = 20;

/// Stores each dump as one file in a directory.
///
/// # File naming
/// `buffer-<id>-<seq>.dump`, where `seq` grows with every write so a
/// re-dump never reuses the previous file name.
pub struct FileDumpStore {
    dir: PathBuf,
    /// Keeps a private temp directory alive; removed on drop.
    _temp: Option<TempDir>,
    next_seq: AtomicU64,
}

impl FileDumpStore {
    /// Create a store in a fresh private temp directory.
    ///
    /// The directory and everything left in it are deleted when the
    /// store is dropped.
    pub fn temporary() -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix("interchange-mem-")
            .tempdir()?;
        Ok(Self {
            dir: temp.path().to_path_buf(),
            _temp: Some(temp),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Create a store in `dir`, creating the directory if needed.
    ///
    /// The directory itself is left in place when the store is dropped.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            _temp: None,
            next_seq: AtomicU64::new(0),
        })
    }

    /// Directory holding the dump files.
    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_path(&self, id: BufferId) -> PathBuf {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("buffer-{}-{}.{}", id.0, seq, DUMP_EXTENSION))
    }

    fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut header = [0u8; DUMP_HEADER_SIZE];
        header[0..8].copy_from_slice(&DUMP_MAGIC);
        header[8..16].copy_from_slice(&(data.len() as u64).to_le_bytes());
        header[16..20].copy_from_slice(&crc32fast::hash(data).to_le_bytes());

        file.write_all(&header)?;
        file.write_all(data)?;
        file.flush()
    }
}

impl DumpStore for FileDumpStore {
    fn write(&self, id: BufferId, data: &[u8]) -> io::Result<DumpHandle> {
        let path = self.next_path(id);

        if let Err(e) = Self::write_file(&path, data) {
            // Partial files are useless; leave nothing behind.
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        Ok(DumpHandle::new(id, path, data.len()))
    }

    fn read(&self, handle: &DumpHandle, out: &mut Vec<u8>) -> Result<()> {
        let id = handle.id();
        let corrupted = |reason: String| Error::CorruptedDump { id, reason };

        let mut file = File::open(handle.path())
            .map_err(|e| corrupted(format!("cannot open {}: {}", handle.path().display(), e)))?;

        let file_len = file
            .metadata()
            .map_err(|e| corrupted(format!("cannot stat {}: {}", handle.path().display(), e)))?
            .len();
        let expected_len = (DUMP_HEADER_SIZE + handle.len()) as u64;
        if file_len != expected_len {
            return Err(corrupted(format!(
                "bad file size, expected {} bytes, was {}",
                expected_len, file_len
            )));
        }

        let mut header = [0u8; DUMP_HEADER_SIZE];
        file.read_exact(&mut header)
            .map_err(|e| corrupted(format!("cannot read header: {}", e)))?;

        if header[0..8] != DUMP_MAGIC {
            return Err(corrupted("bad magic".to_string()));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&header[8..16]);
        let stored_len = u64::from_le_bytes(len_bytes);
        if stored_len != handle.len() as u64 {
            return Err(corrupted(format!(
                "header length {} does not match expected {}",
                stored_len,
                handle.len()
            )));
        }

        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&header[16..20]);
        let stored_crc = u32::from_le_bytes(crc_bytes);

        out.clear();
        let read = (&mut file)
            .take(handle.len() as u64)
            .read_to_end(out)
            .map_err(|e| corrupted(format!("cannot read payload: {}", e)))?;
        if read != handle.len() {
            return Err(corrupted(format!(
                "short read, expected {} bytes, was {}",
                handle.len(),
                read
            )));
        }

        if crc32fast::hash(out) != stored_crc {
            return Err(corrupted("checksum mismatch".to_string()));
        }

        Ok(())
    }

    fn delete(&self, handle: &DumpHandle) -> io::Result<()> {
        fs::remove_file(handle.path())
    }
}

/// Read an external raw file of exactly `size` bytes into `out`.
///
/// Used for buffers adopted from files the manager did not write itself,
/// so there is no header or checksum to verify.
pub fn read_raw_file(id: BufferId, path: &Path, size: usize, out: &mut Vec<u8>) -> Result<()> {
    let corrupted = |reason: String| Error::CorruptedDump { id, reason };

    let mut file = File::open(path)
        .map_err(|e| corrupted(format!("cannot open {}: {}", path.display(), e)))?;
    let file_len = file
        .metadata()
        .map_err(|e| corrupted(format!("cannot stat {}: {}", path.display(), e)))?
        .len();
    if file_len != size as u64 {
        return Err(corrupted(format!(
            "{}: bad file size, expected {} bytes, was {}",
            path.display(),
            size,
            file_len
        )));
    }

    out.clear();
    let read = (&mut file)
        .take(size as u64)
        .read_to_end(out)
        .map_err(|e| corrupted(format!("cannot read {}: {}", path.display(), e)))?;
    if read != size {
        return Err(corrupted(format!(
            "short read, expected {} bytes, was {}",
            size, read
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_write_and_read() {
        let store = FileDumpStore::temporary().unwrap();
        let data = pattern(10_000);

        let handle = store.write(BufferId::new(1), &data).unwrap();
        assert_eq!(handle.len(), data.len());
        assert!(handle.path().exists());

        let mut out = Vec::with_capacity(handle.len());
        store.read(&handle, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_file_layout() {
        let store = FileDumpStore::temporary().unwrap();
        let handle = store.write(BufferId::new(9), b"abc").unwrap();

        let raw = fs::read(handle.path()).unwrap();
        assert_eq!(raw.len(), DUMP_HEADER_SIZE + 3);
        assert_eq!(&raw[0..8], &DUMP_MAGIC);
        assert_eq!(&raw[8..16], &3u64.to_le_bytes());
        assert_eq!(&raw[16..20], &crc32fast::hash(b"abc").to_le_bytes());
        assert_eq!(&raw[20..], b"abc");
    }

    #[test]
    fn test_unique_file_names() {
        let store = FileDumpStore::temporary().unwrap();
        let a = store.write(BufferId::new(1), b"one").unwrap();
        let b = store.write(BufferId::new(1), b"two").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_truncated_file_is_corrupted() {
        let store = FileDumpStore::temporary().unwrap();
        let handle = store.write(BufferId::new(2), &pattern(4096)).unwrap();

        let file = OpenOptions::new().write(true).open(handle.path()).unwrap();
        file.set_len(1000).unwrap();
        drop(file);

        let mut out = Vec::new();
        let err = store.read(&handle, &mut out).unwrap_err();
        assert!(matches!(err, Error::CorruptedDump { .. }));
    }

    #[test]
    fn test_flipped_byte_is_corrupted() {
        let store = FileDumpStore::temporary().unwrap();
        let handle = store.write(BufferId::new(3), &pattern(512)).unwrap();

        let mut raw = fs::read(handle.path()).unwrap();
        raw[DUMP_HEADER_SIZE + 100] ^= 0xFF;
        fs::write(handle.path(), &raw).unwrap();

        let mut out = Vec::new();
        let err = store.read(&handle, &mut out).unwrap_err();
        match err {
            Error::CorruptedDump { reason, .. } => assert!(reason.contains("checksum")),
            other => panic!("Expected CorruptedDump, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic_is_corrupted() {
        let store = FileDumpStore::temporary().unwrap();
        let handle = store.write(BufferId::new(4), b"payload").unwrap();

        let mut raw = fs::read(handle.path()).unwrap();
        raw[0] = b'X';
        fs::write(handle.path(), &raw).unwrap();

        let mut out = Vec::new();
        assert!(store.read(&handle, &mut out).is_err());
    }

    #[test]
    fn test_missing_file_is_corrupted() {
        let store = FileDumpStore::temporary().unwrap();
        let handle = store.write(BufferId::new(5), b"gone").unwrap();
        store.delete(&handle).unwrap();
        assert!(!handle.path().exists());

        let mut out = Vec::new();
        let err = store.read(&handle, &mut out).unwrap_err();
        assert!(matches!(err, Error::CorruptedDump { .. }));
    }

    #[test]
    fn test_temporary_dir_removed_on_drop() {
        let store = FileDumpStore::temporary().unwrap();
        let dir = store.dir().to_path_buf();
        store.write(BufferId::new(1), b"x").unwrap();
        assert!(dir.exists());

        drop(store);
        assert!(!dir.exists());
    }

    #[test]
    fn test_in_dir_creates_directory() {
        let root = tempdir().unwrap();
        let dir = root.path().join("dumps").join("nested");

        let store = FileDumpStore::in_dir(&dir).unwrap();
        let handle = store.write(BufferId::new(1), b"x").unwrap();
        assert!(handle.path().starts_with(&dir));

        drop(store);
        assert!(dir.exists());
    }

    #[test]
    fn test_read_raw_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("volume.raw");
        fs::write(&path, pattern(300)).unwrap();

        let mut out = Vec::new();
        read_raw_file(BufferId::new(1), &path, 300, &mut out).unwrap();
        assert_eq!(out, pattern(300));

        let err = read_raw_file(BufferId::new(1), &path, 301, &mut out).unwrap_err();
        assert!(matches!(err, Error::CorruptedDump { .. }));
    }
}
