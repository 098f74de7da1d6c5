//! # File Handle Cache
//!
//! Connection-wide registry of open files keyed by name. Sessions opening the
//! same file share one handle:
//! - Hash-bucketed table guarded by a single lock
//! - Reference counts changed only under that lock
//! - Racing openers of the same name converge on one handle
//! - Shutdown force-closes whatever is still referenced

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use tierdb_core::error::{Error, Result};
use tierdb_core::metrics::Stats;

use crate::os::{FileSystem, FileType, OpenFlags, OsFile};

const HASH_BUCKETS: usize = 64;

/// A shared open file.
pub struct FileHandle {
    name: String,
    name_hash: u64,
    // Only modified with the cache table locked.
    refs: AtomicU32,
    file: Box<dyn OsFile>,
}

impl FileHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_at(offset, buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_at(offset, data)
    }

    pub fn size(&self) -> Result<u64> {
        self.file.size()
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file.truncate(len)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("name", &self.name)
            .field("refs", &self.refs())
            .finish()
    }
}

struct FhTable {
    buckets: Vec<Vec<Arc<FileHandle>>>,
    open_count: usize,
}

impl FhTable {
    fn find(&self, name: &str, hash: u64) -> Option<&Arc<FileHandle>> {
        self.buckets[bucket_of(hash)]
            .iter()
            .find(|fh| fh.name_hash == hash && fh.name == name)
    }
}

fn name_hash(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

fn bucket_of(hash: u64) -> usize {
    (hash % HASH_BUCKETS as u64) as usize
}

/// Connection-wide file handle cache
pub struct FileHandleCache {
    fs: Arc<dyn FileSystem>,
    table: Mutex<FhTable>,
    stats: Stats,
}

impl FileHandleCache {
    pub fn new(fs: Arc<dyn FileSystem>, stats: Stats) -> Self {
        Self {
            fs,
            table: Mutex::new(FhTable {
                buckets: (0..HASH_BUCKETS).map(|_| Vec::new()).collect(),
                open_count: 0,
            }),
            stats,
        }
    }

    pub fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Open a file, sharing an existing handle when one is cached.
    pub fn open(&self, name: &str, kind: FileType, flags: OpenFlags) -> Result<Arc<FileHandle>> {
        let hash = name_hash(name);

        if let Some(fh) = self.reference(name, hash) {
            return Ok(fh);
        }

        // Open the underlying file without holding the table lock.
        let file = self.fs.open(name, kind, flags)?;
        let missing = file.capabilities().missing(flags.readonly);
        if !missing.is_empty() {
            let _ = file.close();
            return Err(Error::invalid(format!(
                "{}: file handle missing required methods: {}",
                name,
                missing.join(", ")
            )));
        }

        let fresh = Arc::new(FileHandle {
            name: name.to_string(),
            name_hash: hash,
            refs: AtomicU32::new(1),
            file,
        });

        let winner = {
            let mut table = self.table.lock();
            match table.find(name, hash) {
                Some(existing) => {
                    existing.refs.fetch_add(1, Ordering::AcqRel);
                    Some(Arc::clone(existing))
                }
                None => {
                    table.buckets[bucket_of(hash)].push(Arc::clone(&fresh));
                    table.open_count += 1;
                    None
                }
            }
        };

        match winner {
            Some(existing) => {
                // Someone else inserted while we were opening; discard ours.
                self.stats.record_fh_race_lost();
                fresh.refs.store(0, Ordering::Release);
                fresh.file.close()?;
                debug!("file handle race lost: {}", name);
                Ok(existing)
            }
            None => {
                self.stats.record_fh_open();
                debug!("file handle opened: {}", name);
                Ok(fresh)
            }
        }
    }

    fn reference(&self, name: &str, hash: u64) -> Option<Arc<FileHandle>> {
        let table = self.table.lock();
        table.find(name, hash).map(|fh| {
            fh.refs.fetch_add(1, Ordering::AcqRel);
            Arc::clone(fh)
        })
    }

    /// Release one reference; the last release closes the underlying file.
    pub fn close(&self, fh: &Arc<FileHandle>) -> Result<()> {
        {
            let mut table = self.table.lock();
            let refs = fh.refs.load(Ordering::Acquire);
            if refs == 0 {
                return Err(Error::busy(format!(
                    "{}: file handle closed with no outstanding references",
                    fh.name
                )));
            }
            fh.refs.store(refs - 1, Ordering::Release);
            if refs > 1 {
                return Ok(());
            }
            let bucket = &mut table.buckets[bucket_of(fh.name_hash)];
            bucket.retain(|other| !Arc::ptr_eq(other, fh));
            table.open_count -= 1;
        }

        self.stats.record_fh_close();
        debug!("file handle closed: {}", fh.name);
        fh.file.close()
    }

    /// Close every cached handle regardless of outstanding references.
    pub fn close_all(&self) -> Result<()> {
        let handles: Vec<Arc<FileHandle>> = {
            let mut table = self.table.lock();
            table.open_count = 0;
            table.buckets.iter_mut().flat_map(|b| b.drain(..)).collect()
        };

        let mut first_err = None;
        for fh in handles {
            let refs = fh.refs.swap(0, Ordering::AcqRel);
            if refs > 0 {
                warn!("{}: file handle still has {} open references at close", fh.name, refs);
            }
            self.stats.record_fh_close();
            if let Err(e) = fh.file.close() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether a handle for `name` is currently cached.
    pub fn is_open(&self, name: &str) -> bool {
        let hash = name_hash(name);
        self.table.lock().find(name, hash).is_some()
    }

    pub fn open_count(&self) -> usize {
        self.table.lock().open_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::LocalFileSystem;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> FileHandleCache {
        let fs = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        FileHandleCache::new(fs, Stats::new())
    }

    #[test]
    fn test_open_shares_handle() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let flags = OpenFlags {
            create: true,
            ..Default::default()
        };

        let a = cache.open("t.wt", FileType::Data, flags).unwrap();
        let b = cache.open("t.wt", FileType::Data, flags).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refs(), 2);
        assert_eq!(cache.open_count(), 1);

        cache.close(&a).unwrap();
        assert!(cache.is_open("t.wt"));
        cache.close(&b).unwrap();
        assert!(!cache.is_open("t.wt"));
        assert_eq!(cache.open_count(), 0);
    }

    #[test]
    fn test_close_without_reference_is_busy() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let fh = cache.open("t.wt", FileType::Data, OpenFlags::create_exclusive()).unwrap();
        cache.close(&fh).unwrap();
        let err = cache.close(&fh).unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    fn test_close_all_forces_referenced_handles() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let fh = cache.open("t.wt", FileType::Data, OpenFlags::create_exclusive()).unwrap();
        let _again = cache.open("t.wt", FileType::Data, OpenFlags::default()).unwrap();
        cache.close_all().unwrap();
        assert_eq!(cache.open_count(), 0);
        assert_eq!(fh.refs(), 0);
        assert!(fh.size().is_err());
    }
}
