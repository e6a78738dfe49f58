//! Append-Only File Store
//!
//! `MemoryStore` backed by a log of SET records. The log is replayed on
//! open; a torn record at the tail is cut off.
//!
//! Record layout (little endian):
//!
//! ```text
//! ┌──────────┬────────┬──────────┬───────┬──────────┬─────────┐
//! │ Body Len │ OpCode │ Key Len  │  Key  │ Val Len  │  Value  │
//! │ (4 bytes)│(1 byte)│ (4 bytes)│       │ (4 bytes)│         │
//! └──────────┴────────┴──────────┴───────┴──────────┴─────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{KvStore, MemoryStore};
use crate::error::StoreError;

const OP_SET: u8 = 1;
const LEN_PREFIX: usize = 4;

/// AOF sync modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AofSyncMode {
    /// Only durable puts and explicit flushes reach the disk
    #[default]
    No,
    /// Flushed by a periodic server timer
    EverySecond,
    /// Every put is flushed and synced
    Always,
}

/// AOF configuration
#[derive(Debug, Clone)]
pub struct AofConfig {
    /// AOF file path
    pub path: PathBuf,
    /// Sync mode
    pub sync_mode: AofSyncMode,
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/roost.aof"),
            sync_mode: AofSyncMode::No,
        }
    }
}

impl AofConfig {
    pub fn with_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_sync_mode(mut self, mode: AofSyncMode) -> Self {
        self.sync_mode = mode;
        self
    }
}

/// Log-backed key-value store
pub struct AofStore {
    config: AofConfig,
    memory: MemoryStore,
    writer: Mutex<BufWriter<File>>,
}

impl AofStore {
    /// Open or create the log and replay it into memory
    ///
    /// # Errors
    ///
    /// `StoreError::Open` if the file cannot be created or read,
    /// `StoreError::Corrupt` if a complete record cannot be decoded.
    pub fn open(config: AofConfig) -> Result<Self, StoreError> {
        let open_error = |source| StoreError::Open {
            path: config.path.display().to_string(),
            source,
        };

        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_error)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&config.path)
            .map_err(open_error)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents).map_err(open_error)?;

        let memory = MemoryStore::new();
        let valid = replay(&contents, &memory)?;
        if valid < contents.len() {
            warn!(
                path = %config.path.display(),
                dropped = contents.len() - valid,
                "Truncating torn AOF tail"
            );
            file.set_len(valid as u64).map_err(open_error)?;
        }

        info!(
            path = %config.path.display(),
            keys = memory.len(),
            "AOF replayed"
        );

        Ok(Self {
            config,
            memory,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn sync_mode(&self) -> AofSyncMode {
        self.config.sync_mode
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    fn sync(writer: &mut BufWriter<File>) -> Result<(), StoreError> {
        writer.flush().map_err(StoreError::Write)?;
        writer.get_ref().sync_data().map_err(StoreError::Write)
    }
}

impl KvStore for AofStore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self.memory.lookup(key))
    }

    fn put(&self, key: Bytes, value: Bytes, durable: bool) -> Result<(), StoreError> {
        let record = encode_set(&key, &value);
        {
            let mut writer = self.writer.lock();
            writer.write_all(&record).map_err(StoreError::Write)?;
            if durable || self.config.sync_mode == AofSyncMode::Always {
                Self::sync(&mut writer)?;
            }
        }
        self.memory.insert(key, value);
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Self::sync(&mut self.writer.lock())
    }
}

fn encode_set(key: &[u8], value: &[u8]) -> Bytes {
    let body_len = 1 + 4 + key.len() + 4 + value.len();
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body_len);
    buf.put_u32_le(body_len as u32);
    buf.put_u8(OP_SET);
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
    buf.freeze()
}

/// Apply every complete record, returning the length of the valid prefix
fn replay(contents: &[u8], memory: &MemoryStore) -> Result<usize, StoreError> {
    let mut offset = 0;

    while contents.len() - offset >= LEN_PREFIX {
        let mut header = &contents[offset..offset + LEN_PREFIX];
        let body_len = header.get_u32_le() as usize;
        let start = offset + LEN_PREFIX;
        if contents.len() - start < body_len {
            break;
        }

        let (key, value) = decode_set(&contents[start..start + body_len])
            .ok_or(StoreError::Corrupt(offset as u64))?;
        memory.insert(key, value);
        offset = start + body_len;
    }

    Ok(offset)
}

fn decode_set(mut body: &[u8]) -> Option<(Bytes, Bytes)> {
    if body.remaining() < 1 || body.get_u8() != OP_SET {
        return None;
    }
    let key = read_chunk(&mut body)?;
    let value = read_chunk(&mut body)?;
    body.is_empty().then_some((key, value))
}

fn read_chunk(body: &mut &[u8]) -> Option<Bytes> {
    if body.remaining() < 4 {
        return None;
    }
    let len = body.get_u32_le() as usize;
    if body.remaining() < len {
        return None;
    }
    Some(body.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(store: &AofStore, key: &'static str, value: &'static str, durable: bool) {
        store
            .put(Bytes::from_static(key.as_bytes()), Bytes::from_static(value.as_bytes()), durable)
            .unwrap();
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = tempdir().unwrap();
        let config = AofConfig::default().with_path(dir.path().join("nested/test.aof"));

        let store = AofStore::open(config.clone()).unwrap();
        put(&store, "k1", "v1", false);
        put(&store, "k1", "v2", false);
        put(&store, "k2", "", false);
        store.flush().unwrap();
        drop(store);

        let store = AofStore::open(config).unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(Bytes::from_static(b"v2")));
        assert_eq!(store.get(b"k2").unwrap(), Some(Bytes::new()));
        assert_eq!(store.get(b"k3").unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_durable_put_reaches_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("durable.aof");
        let store = AofStore::open(AofConfig::default().with_path(&path)).unwrap();

        put(&store, "buffered", "x", false);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        put(&store, "key", "value", true);
        let expected = encode_set(b"buffered", b"x").len() + encode_set(b"key", b"value").len();
        assert_eq!(fs::metadata(&path).unwrap().len(), expected as u64);
    }

    #[test]
    fn test_always_mode_syncs_every_put() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("always.aof");
        let config = AofConfig::default()
            .with_path(&path)
            .with_sync_mode(AofSyncMode::Always);
        let store = AofStore::open(config).unwrap();

        put(&store, "k", "v", false);
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            encode_set(b"k", b"v").len() as u64
        );
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.aof");

        let good = encode_set(b"a", b"1");
        let torn = encode_set(b"b", b"2");
        let mut contents = good.to_vec();
        contents.extend_from_slice(&torn[..torn.len() - 3]);
        fs::write(&path, &contents).unwrap();

        let store = AofStore::open(AofConfig::default().with_path(&path)).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(fs::metadata(&path).unwrap().len(), good.len() as u64);
    }

    #[test]
    fn test_corrupt_record_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.aof");

        let mut record = encode_set(b"a", b"1").to_vec();
        record[LEN_PREFIX] = 9;
        fs::write(&path, &record).unwrap();

        let err = AofStore::open(AofConfig::default().with_path(&path)).err().unwrap();
        assert!(matches!(err, StoreError::Corrupt(0)));
    }
}
