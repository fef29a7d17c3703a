// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The local storage collaborator.
//!
//! The ledger core only ever needs a narrow keyed interface: `get`,
//! `put`, `range_scan`. Committed blocks (keyed by height and by hash),
//! pending event-log entries, the chain head pointer, and optional
//! view snapshots all go through it. No relational engine is required.
//!
//! `FileStore` is the production implementation: an append-only record
//! log with a crc64 checksum per record, fsync'd on every put, replayed
//! into an in-memory ordered index on open with last-write-wins
//! semantics. Partial tail records from a crash are dropped; a checksum
//! mismatch anywhere earlier fails closed.
//!
//! # Record Format
//! ```text
//! [key_len: u32 LE][val_len: u32 LE][checksum: u64 LE][key][value]
//! ```

use crc64fast::Digest;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch at offset {offset}: expected {expected}, found {found}")]
    ChecksumMismatch {
        offset: u64,
        expected: u64,
        found: u64,
    },

    #[error("record decode failed: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Narrow keyed read/write interface consumed by the ledger core.
///
/// `range_scan` returns entries with `start <= key < end` in ascending
/// key order.
pub trait RecordStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

const RECORD_HEADER_SIZE: usize = 4 + 4 + 8;

fn record_checksum(key: &[u8], value: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(&(key.len() as u32).to_le_bytes());
    digest.write(&(value.len() as u32).to_le_bytes());
    digest.write(key);
    digest.write(value);
    digest.sum64()
}

struct FileStoreInner {
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    file: File,
}

/// Append-only file-backed store.
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<FileStoreInner>,
}

impl FileStore {
    /// Open or create the store, replaying the record log into the index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let mut index = BTreeMap::new();
        let mut offset = 0usize;

        while offset < buffer.len() {
            let remaining = buffer.len() - offset;
            if remaining < RECORD_HEADER_SIZE {
                tracing::warn!(
                    "dropping incomplete record header at offset {} ({} bytes)",
                    offset,
                    remaining
                );
                break;
            }

            let header = &buffer[offset..offset + RECORD_HEADER_SIZE];
            let key_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
            let val_len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
            let checksum = u64::from_le_bytes(header[8..16].try_into().unwrap());

            let body_start = offset + RECORD_HEADER_SIZE;
            if buffer.len() < body_start + key_len + val_len {
                // Crash mid-append; everything before this record is intact.
                tracing::warn!("dropping incomplete record body at offset {}", offset);
                break;
            }

            let key = &buffer[body_start..body_start + key_len];
            let value = &buffer[body_start + key_len..body_start + key_len + val_len];

            let found = record_checksum(key, value);
            if found != checksum {
                return Err(StoreError::ChecksumMismatch {
                    offset: offset as u64,
                    expected: checksum,
                    found,
                });
            }

            index.insert(key.to_vec(), value.to_vec());
            offset = body_start + key_len + val_len;
        }

        Ok(Self {
            path,
            inner: Mutex::new(FileStoreInner { index, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.index.get(key).cloned())
    }

    /// Append the record and fsync before updating the index; a put that
    /// returns `Ok` is durable.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let checksum = record_checksum(key, value);
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value.len());
        record.extend_from_slice(&(key.len() as u32).to_le_bytes());
        record.extend_from_slice(&(value.len() as u32).to_le_bytes());
        record.extend_from_slice(&checksum.to_le_bytes());
        record.extend_from_slice(key);
        record.extend_from_slice(value);

        inner.file.write_all(&record)?;
        inner.file.sync_data()?;

        inner.index.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .index
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemStore {
    index: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.index.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.index.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .index
            .lock()
            .unwrap()
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Key layout for everything the node persists.
pub mod keys {
    use forgeline_kernel::types::hash::BlockHash;

    /// Committed block by height. Big-endian so `range_scan` walks the
    /// chain in order.
    pub fn block(height: u64) -> Vec<u8> {
        let mut key = b"block/".to_vec();
        key.extend_from_slice(&height.to_be_bytes());
        key
    }

    pub fn block_range() -> (Vec<u8>, Vec<u8>) {
        (block(0), b"block0".to_vec())
    }

    /// Height of a committed block by hash.
    pub fn block_hash(hash: &BlockHash) -> Vec<u8> {
        let mut key = b"blkhash/".to_vec();
        key.extend_from_slice(hash.as_bytes());
        key
    }

    pub fn chain_head() -> Vec<u8> {
        b"chain_head".to_vec()
    }

    /// Pending event-log entry by sequence.
    pub fn pending(seq: u64) -> Vec<u8> {
        let mut key = b"pending/".to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    pub fn pending_range() -> (Vec<u8>, Vec<u8>) {
        (pending(0), b"pending0".to_vec())
    }

    /// Highest pending sequence already included in a committed block.
    pub fn sealed_watermark() -> Vec<u8> {
        b"sealed_watermark".to_vec()
    }

    pub fn snapshot() -> Vec<u8> {
        b"snapshot".to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("test.db")).unwrap();

        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_last_write_wins_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = FileStore::open(&path).unwrap();
            store.put(b"key", b"old").unwrap();
            store.put(b"key", b"new").unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"key").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_range_scan_is_ordered() {
        let store = MemStore::new();
        store.put(&keys::block(2), b"two").unwrap();
        store.put(&keys::block(0), b"zero").unwrap();
        store.put(&keys::block(1), b"one").unwrap();
        store.put(b"other", b"x").unwrap();

        let (start, end) = keys::block_range();
        let hits = store.range_scan(&start, &end).unwrap();

        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].1, b"zero");
        assert_eq!(hits[1].1, b"one");
        assert_eq!(hits[2].1, b"two");
    }

    #[test]
    fn test_incomplete_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = FileStore::open(&path).unwrap();
            store.put(b"intact", b"value").unwrap();
        }

        // Simulate a crash mid-append: a truncated record header.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0x05, 0x00]).unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"intact").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn test_corrupt_record_fails_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = FileStore::open(&path).unwrap();
            store.put(b"aaaa", b"11111111").unwrap();
            store.put(b"bbbb", b"22222222").unwrap();
        }

        // Flip a value byte inside the first record.
        {
            let mut data = std::fs::read(&path).unwrap();
            let idx = RECORD_HEADER_SIZE + 4; // first byte of the first value
            data[idx] ^= 0xFF;
            std::fs::write(&path, &data).unwrap();
        }

        match FileStore::open(&path) {
            Err(StoreError::ChecksumMismatch { offset: 0, .. }) => {}
            other => panic!("expected checksum failure, got {:?}", other.map(|_| ())),
        }
    }
}
