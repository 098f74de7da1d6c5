//! Connection: the shared state every session of a database works against.
//!
//! ```text
//! ┌──────────────────────── ConnectionInner ────────────────────────┐
//! │  metadata ── dhandles ── records ── blocks ── fh_cache ── fs    │
//! │  schema_lock   checkpoint_lock   timestamps   stats             │
//! │  tiered: storage server + manager threads, work queue           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock order is checkpoint lock, then schema lock.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use tierdb_core::config::ConnectionConfig;
use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};
use tierdb_core::metrics::{Stats, StatsSnapshot};
use tierdb_core::types::{Timestamp, TS_NONE};

use crate::block::BlockManager;
use crate::dhandle::DataHandleRegistry;
use crate::fhandle::FileHandleCache;
use crate::metadata::{write_export, MetadataStore};
use crate::os::{FileSystem, LocalFileSystem};
use crate::records::RecordStore;
use crate::schema::DataSource;
use crate::session::Session;
use crate::tiered::{BucketStorage, StorageSource, TieredManager};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalTimestamps {
    pub oldest: Timestamp,
    pub stable: Timestamp,
}

pub struct ConnectionInner {
    pub(crate) home: PathBuf,
    pub(crate) config: ConnectionConfig,
    pub(crate) fh_cache: Arc<FileHandleCache>,
    pub(crate) blocks: BlockManager,
    pub(crate) metadata: MetadataStore,
    pub(crate) dhandles: DataHandleRegistry,
    pub(crate) records: RecordStore,
    data_sources: RwLock<HashMap<String, Arc<dyn DataSource>>>,
    pub(crate) next_file_id: AtomicU32,
    next_session_id: AtomicU64,
    pub(crate) schema_lock: Mutex<()>,
    pub(crate) checkpoint_lock: Mutex<()>,
    pub(crate) timestamps: Mutex<GlobalTimestamps>,
    pub(crate) tiered: Option<TieredManager>,
    pub(crate) stats: Stats,
    panicked: AtomicBool,
    panic_message: Mutex<Option<String>>,
}

impl ConnectionInner {
    pub(crate) fn fs(&self) -> &Arc<dyn FileSystem> {
        self.fh_cache.file_system()
    }

    /// Next unused file id.
    pub(crate) fn allocate_file_id(&self) -> u32 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn data_source(&self, prefix: &str) -> Option<Arc<dyn DataSource>> {
        self.data_sources.read().get(prefix).cloned()
    }

    /// Fail once a background thread has hit an unrecoverable error.
    pub(crate) fn check_panic(&self) -> Result<()> {
        if !self.panicked.load(Ordering::Acquire) {
            return Ok(());
        }
        let message = self
            .panic_message
            .lock()
            .clone()
            .unwrap_or_else(|| "background thread failed".to_string());
        Err(Error::Panic { message })
    }

    pub(crate) fn set_panic(&self, message: String) {
        error!("connection panic: {}", message);
        *self.panic_message.lock() = Some(message);
        self.panicked.store(true, Ordering::Release);
        self.stats.record_panic();
        if let Some(tiered) = &self.tiered {
            tiered.tracker.notify();
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_readonly(&self) -> bool {
        self.config.readonly
    }

    /// Reload rows of every checkpointed local data file.
    fn load_records(&self) -> Result<()> {
        let mut loaded = 0usize;
        for (uri, config) in self.metadata.scan_prefix("file:") {
            let cfg = ConfigString::parse(&config)?;
            if cfg.get_bool("tiered_object").unwrap_or(false) {
                continue;
            }
            let name = uri.trim_start_matches("file:");
            if !self.fs().exists(name)? {
                debug!("{}: data file missing, no rows loaded", uri);
                continue;
            }
            let desc = self.blocks.read(name)?;
            self.records.load(&uri, desc.payload.rows);
            loaded += 1;
        }
        debug!("loaded rows of {} data files", loaded);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(tiered) = &self.tiered {
            tiered.shutdown();
        }
        self.fh_cache.close_all()
    }
}

/// An open database.
pub struct Connection {
    inner: Arc<ConnectionInner>,
    closed: AtomicBool,
}

impl Connection {
    /// Open (creating if needed) the database in `home`.
    pub fn open(home: impl AsRef<Path>, config: &str) -> Result<Self> {
        let config = ConnectionConfig::from_config_str(config)?;
        let source: Option<Arc<dyn StorageSource>> = match &config.tiered_storage {
            Some(tiered) => Some(Arc::new(BucketStorage::from_config(tiered)?)),
            None => None,
        };
        Self::build(home.as_ref(), config, source)
    }

    /// Open with a caller-supplied object store for tiered storage.
    pub fn open_with_source(
        home: impl AsRef<Path>,
        config: &str,
        source: Arc<dyn StorageSource>,
    ) -> Result<Self> {
        let config = ConnectionConfig::from_config_str(config)?;
        Self::build(home.as_ref(), config, Some(source))
    }

    fn build(home: &Path, config: ConnectionConfig, source: Option<Arc<dyn StorageSource>>) -> Result<Self> {
        fs::create_dir_all(home)?;
        let stats = Stats::new();
        let file_system: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(home)?);
        let fh_cache = Arc::new(FileHandleCache::new(file_system, stats.clone()));
        let metadata = MetadataStore::open(home, config.readonly)?;
        let max_file_id = metadata.max_file_id();

        let tiered = match (&config.tiered_storage, source) {
            (Some(_), Some(source)) => Some(TieredManager::new(
                source,
                stats.clone(),
                config.flush_wait.spin_iterations,
                config.flush_wait.cond_wait,
            )),
            _ => None,
        };

        let inner = Arc::new(ConnectionInner {
            home: home.to_path_buf(),
            blocks: BlockManager::new(Arc::clone(&fh_cache)),
            fh_cache,
            metadata,
            dhandles: DataHandleRegistry::new(),
            records: RecordStore::new(),
            data_sources: RwLock::new(HashMap::new()),
            next_file_id: AtomicU32::new(max_file_id),
            next_session_id: AtomicU64::new(1),
            schema_lock: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            timestamps: Mutex::new(GlobalTimestamps {
                oldest: TS_NONE,
                stable: TS_NONE,
            }),
            tiered,
            stats,
            panicked: AtomicBool::new(false),
            panic_message: Mutex::new(None),
            config,
        });

        inner.load_records()?;
        let conn = Self {
            inner,
            closed: AtomicBool::new(false),
        };
        TieredManager::start(&conn.inner)?;
        info!(
            "opened database {}: {} metadata entries, tiered={}",
            home.display(),
            conn.inner.metadata.len(),
            conn.inner.tiered.is_some()
        );
        Ok(conn)
    }

    pub fn open_session(&self) -> Session {
        Session::internal(Arc::clone(&self.inner))
    }

    /// Register a handler for a custom `<prefix>:` namespace.
    pub fn register_data_source(&self, prefix: &str, source: Arc<dyn DataSource>) -> Result<()> {
        let mut sources = self.inner.data_sources.write();
        if sources.contains_key(prefix) {
            return Err(Error::exists(format!("data source {}", prefix)));
        }
        sources.insert(prefix.to_string(), source);
        debug!("registered data source {}", prefix);
        Ok(())
    }

    pub fn set_oldest_timestamp(&self, ts: Timestamp) -> Result<()> {
        let mut timestamps = self.inner.timestamps.lock();
        if ts > timestamps.stable && timestamps.stable != TS_NONE {
            return Err(Error::invalid(format!(
                "oldest timestamp {} must not be later than the stable timestamp {}",
                ts, timestamps.stable
            )));
        }
        timestamps.oldest = ts;
        Ok(())
    }

    pub fn set_stable_timestamp(&self, ts: Timestamp) -> Result<()> {
        let mut timestamps = self.inner.timestamps.lock();
        if ts < timestamps.oldest {
            return Err(Error::invalid(format!(
                "stable timestamp {} must not be earlier than the oldest timestamp {}",
                ts, timestamps.oldest
            )));
        }
        timestamps.stable = ts;
        Ok(())
    }

    pub fn timestamps(&self) -> GlobalTimestamps {
        *self.inner.timestamps.lock()
    }

    /// Write every metadata entry to an export file usable by
    /// `import=(metadata_file=...)`.
    pub fn export_metadata(&self, path: impl AsRef<Path>) -> Result<usize> {
        let entries = self.inner.metadata.list();
        write_export(&entries, File::create(path.as_ref())?)?;
        info!("exported {} metadata entries to {}", entries.len(), path.as_ref().display());
        Ok(entries.len())
    }

    /// Metadata entries in URI order.
    pub fn metadata_list(&self) -> Vec<(String, String)> {
        self.inner.metadata.list()
    }

    pub fn metadata_search(&self, uri: &str) -> Result<String> {
        self.inner.metadata.search(uri)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Work units queued for flushing and not yet freed.
    pub fn tiered_work_pending(&self) -> u64 {
        self.inner.tiered.as_ref().map(|t| t.pending()).unwrap_or(0)
    }

    /// Open file handles in the connection's cache.
    pub fn open_file_handles(&self) -> usize {
        self.inner.fh_cache.open_count()
    }

    pub fn home(&self) -> &Path {
        self.inner.home()
    }

    /// Stop background threads and close cached file handles. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.close()?;
        info!("closed database {}", self.inner.home.display());
        self.inner.check_panic()
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
