//! # Block Manager
//!
//! Data file layout:
//!
//! ```text
//! ┌──────────────────────────── allocation_size bytes ───────────────────────────┐
//! │ magic(8) │ version(4) │ allocsize(4) │ major(2) │ minor(2) │ len(8) │ crc(4) │ hcrc(4) │ pad │
//! ├──────────────────────────────────────────────────────────────────────────────┤
//! │ payload: msgpack FilePayload (formats, checkpoint descriptors, rows)         │
//! └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The header is enough to rebuild a file's metadata when it is imported
//! with `import.repair`.

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tierdb_core::checksum::crc32_checksum;
use tierdb_core::config_string::{ConfigString, ConfigValue};
use tierdb_core::error::{Error, Result};
use tierdb_core::types::{BtreeVersion, Timestamp, TS_NONE};

use crate::fhandle::{FileHandle, FileHandleCache};
use crate::os::{FileType, OpenFlags};
use crate::records::StoredRow;

const BLOCK_MAGIC: &[u8; 8] = b"TIERDBF\0";
const BLOCK_VERSION: u32 = 1;
const HEADER_SIZE: usize = 36;

/// Smallest allocation unit a file may use.
pub const MIN_ALLOCATION_SIZE: u32 = 512;
pub const DEFAULT_ALLOCATION_SIZE: u32 = 4096;

/// Name prefix of engine checkpoints.
pub const CHECKPOINT_NAME: &str = "WiredTigerCheckpoint";

/// Summary of one checkpoint stored in the file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDescriptor {
    pub name: String,
    pub order: u64,
    pub time: u64,
    pub newest_start_durable_ts: Timestamp,
    pub newest_stop_durable_ts: Timestamp,
    pub row_count: u64,
}

impl CheckpointDescriptor {
    /// `"name"=(order=..,time=..,...)` entry of a `checkpoint=(...)` list.
    pub fn config_entry(&self) -> ConfigString {
        let mut c = ConfigString::new();
        c.set_int("order", self.order as i64);
        c.set_int("time", self.time as i64);
        c.set_int("newest_start_durable_ts", self.newest_start_durable_ts as i64);
        c.set_int("newest_stop_durable_ts", self.newest_stop_durable_ts as i64);
        c.set_int("row_count", self.row_count as i64);
        c
    }

    /// Parse every checkpoint out of an object's `checkpoint=(...)` setting.
    pub fn from_config(config: &ConfigString) -> Vec<CheckpointDescriptor> {
        let Some(list) = config.get_struct("checkpoint") else {
            return Vec::new();
        };
        list.iter()
            .filter_map(|(name, value)| match value {
                ConfigValue::Struct(c) => Some(CheckpointDescriptor {
                    name: name.to_string(),
                    order: c.get_int("order").unwrap_or(0) as u64,
                    time: c.get_int("time").unwrap_or(0) as u64,
                    newest_start_durable_ts: c.get_int("newest_start_durable_ts").unwrap_or(0) as u64,
                    newest_stop_durable_ts: c.get_int("newest_stop_durable_ts").unwrap_or(0) as u64,
                    row_count: c.get_int("row_count").unwrap_or(0) as u64,
                }),
                _ => None,
            })
            .collect()
    }
}

/// Build a `checkpoint=(...)` value from descriptors.
pub fn checkpoint_config(checkpoints: &[CheckpointDescriptor]) -> ConfigValue {
    let mut list = ConfigString::new();
    for ckpt in checkpoints {
        list.insert_raw(&ckpt.name, ConfigValue::Struct(ckpt.config_entry()));
    }
    ConfigValue::Struct(list)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilePayload {
    pub key_format: String,
    pub value_format: String,
    pub checkpoints: Vec<CheckpointDescriptor>,
    pub rows: Vec<StoredRow>,
}

/// Everything stored in a data file.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub allocation_size: u32,
    pub version: BtreeVersion,
    pub payload: FilePayload,
}

impl FileDescriptor {
    /// Metadata reconstructed from the file itself.
    pub fn repair_config(&self) -> String {
        let mut c = ConfigString::new();
        c.set_int("allocation_size", self.allocation_size as i64);
        c.set_str("key_format", self.payload.key_format.clone());
        c.set_str("value_format", self.payload.value_format.clone());
        c.set_int("version.major", self.version.major as i64);
        c.set_int("version.minor", self.version.minor as i64);
        c.set("checkpoint", checkpoint_config(&self.payload.checkpoints));
        c.set_str("checkpoint_lsn", "");
        c.to_string()
    }

    pub fn latest_checkpoint(&self) -> Option<&CheckpointDescriptor> {
        self.payload.checkpoints.iter().max_by_key(|c| c.order)
    }
}

/// Reads and writes data files through the file handle cache.
pub struct BlockManager {
    fh_cache: Arc<FileHandleCache>,
}

impl BlockManager {
    pub fn new(fh_cache: Arc<FileHandleCache>) -> Self {
        Self { fh_cache }
    }

    /// Create a new, empty data file. Fails if the file exists.
    pub fn create(&self, name: &str, allocation_size: u32, key_format: &str, value_format: &str) -> Result<()> {
        if allocation_size < MIN_ALLOCATION_SIZE {
            return Err(Error::invalid(format!(
                "{}: allocation size {} smaller than minimum {}",
                name, allocation_size, MIN_ALLOCATION_SIZE
            )));
        }
        let fh = self.fh_cache.open(name, FileType::Data, OpenFlags::create_exclusive())?;
        let payload = FilePayload {
            key_format: key_format.to_string(),
            value_format: value_format.to_string(),
            ..Default::default()
        };
        let result = write_file(&fh, allocation_size, BtreeVersion::CURRENT, &payload);
        let closed = self.fh_cache.close(&fh);
        result.and(closed)?;
        debug!("block manager created {} allocsize={}", name, allocation_size);
        Ok(())
    }

    pub fn read(&self, name: &str) -> Result<FileDescriptor> {
        let fh = self.fh_cache.open(name, FileType::Data, OpenFlags::readonly())?;
        let result = read_file(&fh);
        let closed = self.fh_cache.close(&fh);
        let desc = result?;
        closed?;
        Ok(desc)
    }

    /// Append a checkpoint and replace the stored rows.
    pub fn checkpoint(&self, name: &str, rows: Vec<StoredRow>, time: u64) -> Result<CheckpointDescriptor> {
        let fh = self.fh_cache.open(name, FileType::Data, OpenFlags::default())?;
        let result = (|| -> Result<CheckpointDescriptor> {
            let mut desc = read_file(&fh)?;
            let order = desc.latest_checkpoint().map(|c| c.order + 1).unwrap_or(1);
            let ckpt = CheckpointDescriptor {
                name: format!("{}.{}", CHECKPOINT_NAME, order),
                order,
                time,
                newest_start_durable_ts: rows.iter().map(|r| r.start_ts).max().unwrap_or(TS_NONE),
                newest_stop_durable_ts: rows.iter().filter_map(|r| r.stop_ts).max().unwrap_or(TS_NONE),
                row_count: rows.len() as u64,
            };
            // Only the most recent checkpoint is kept.
            desc.payload.checkpoints = vec![ckpt.clone()];
            desc.payload.rows = rows;
            write_file(&fh, desc.allocation_size, desc.version, &desc.payload)?;
            Ok(ckpt)
        })();
        let closed = self.fh_cache.close(&fh);
        let ckpt = result?;
        closed?;
        Ok(ckpt)
    }
}

fn write_file(fh: &FileHandle, allocation_size: u32, version: BtreeVersion, payload: &FilePayload) -> Result<()> {
    let body = rmp_serde::to_vec(payload).map_err(|e| Error::Corruption {
        details: format!("{}: failed to encode file payload: {}", fh.name(), e),
    })?;

    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(BLOCK_MAGIC);
    header.write_u32::<LittleEndian>(BLOCK_VERSION)?;
    header.write_u32::<LittleEndian>(allocation_size)?;
    header.write_u16::<LittleEndian>(version.major)?;
    header.write_u16::<LittleEndian>(version.minor)?;
    header.write_u64::<LittleEndian>(body.len() as u64)?;
    header.write_u32::<LittleEndian>(crc32_checksum(&body))?;
    let header_crc = crc32_checksum(&header);
    header.write_u32::<LittleEndian>(header_crc)?;

    let mut block = BytesMut::with_capacity(allocation_size as usize + body.len());
    block.put_slice(&header);
    block.resize(allocation_size as usize, 0);
    block.put_slice(&body);

    fh.truncate(0)?;
    fh.write_at(0, &block)?;
    fh.sync()
}

fn read_file(fh: &FileHandle) -> Result<FileDescriptor> {
    let corrupt = |what: &str| Error::Corruption {
        details: format!("{}: {}", fh.name(), what),
    };

    if fh.size()? < HEADER_SIZE as u64 {
        return Err(corrupt("file too small for a block header"));
    }
    let mut header = [0u8; HEADER_SIZE];
    fh.read_at(0, &mut header)?;

    if &header[..8] != BLOCK_MAGIC {
        return Err(corrupt("bad block magic"));
    }
    let mut cursor = Cursor::new(&header[8..]);
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != BLOCK_VERSION {
        return Err(corrupt(&format!("unsupported block version {}", version)));
    }
    let allocation_size = cursor.read_u32::<LittleEndian>()?;
    let major = cursor.read_u16::<LittleEndian>()?;
    let minor = cursor.read_u16::<LittleEndian>()?;
    let len = cursor.read_u64::<LittleEndian>()?;
    let body_crc = cursor.read_u32::<LittleEndian>()?;
    let header_crc = cursor.read_u32::<LittleEndian>()?;
    if crc32_checksum(&header[..HEADER_SIZE - 4]) != header_crc {
        return Err(corrupt("block header checksum mismatch"));
    }

    let mut body = vec![0u8; len as usize];
    fh.read_at(allocation_size as u64, &mut body)?;
    if crc32_checksum(&body) != body_crc {
        return Err(corrupt("payload checksum mismatch"));
    }
    let payload: FilePayload =
        rmp_serde::from_slice(&body).map_err(|e| corrupt(&format!("failed to decode payload: {}", e)))?;

    Ok(FileDescriptor {
        allocation_size,
        version: BtreeVersion { major, minor },
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::LocalFileSystem;
    use tempfile::TempDir;
    use tierdb_core::metrics::Stats;

    fn manager(dir: &TempDir) -> BlockManager {
        let fs = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        BlockManager::new(Arc::new(FileHandleCache::new(fs, Stats::new())))
    }

    fn row(k: &str, start: u64, stop: Option<u64>) -> StoredRow {
        StoredRow {
            key: vec![k.to_string()],
            values: vec!["v".to_string()],
            start_ts: start,
            stop_ts: stop,
        }
    }

    #[test]
    fn test_create_and_read() {
        let dir = TempDir::new().unwrap();
        let bm = manager(&dir);
        bm.create("a.wt", 4096, "S", "S").unwrap();
        let desc = bm.read("a.wt").unwrap();
        assert_eq!(desc.allocation_size, 4096);
        assert_eq!(desc.version, BtreeVersion::CURRENT);
        assert!(desc.payload.checkpoints.is_empty());
        assert!(bm.create("a.wt", 4096, "S", "S").is_err());
    }

    #[test]
    fn test_checkpoint_aggregates_timestamps() {
        let dir = TempDir::new().unwrap();
        let bm = manager(&dir);
        bm.create("a.wt", 512, "S", "S").unwrap();
        let ckpt = bm
            .checkpoint("a.wt", vec![row("a", 10, None), row("b", 30, Some(50)), row("c", 20, None)], 1)
            .unwrap();
        assert_eq!(ckpt.order, 1);
        assert_eq!(ckpt.newest_start_durable_ts, 30);
        assert_eq!(ckpt.newest_stop_durable_ts, 50);

        let second = bm.checkpoint("a.wt", vec![row("a", 10, None)], 2).unwrap();
        assert_eq!(second.order, 2);

        let desc = bm.read("a.wt").unwrap();
        assert_eq!(desc.payload.rows.len(), 1);
        let cfg = ConfigString::parse(&desc.repair_config()).unwrap();
        let ckpts = CheckpointDescriptor::from_config(&cfg);
        assert_eq!(ckpts.len(), 1);
        assert_eq!(ckpts[0].name, "WiredTigerCheckpoint.2");
        assert_eq!(cfg.get_int("allocation_size"), Some(512));
    }

    #[test]
    fn test_corrupt_header_detected() {
        let dir = TempDir::new().unwrap();
        let bm = manager(&dir);
        bm.create("a.wt", 512, "u", "u").unwrap();
        std::fs::write(dir.path().join("a.wt"), b"garbage garbage garbage garbage garbage").unwrap();
        assert!(matches!(bm.read("a.wt"), Err(Error::Corruption { .. })));
    }
}
