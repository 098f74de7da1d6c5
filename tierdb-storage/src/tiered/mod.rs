//! # Tiered Storage
//!
//! ```text
//!  flush_tier / manager tick
//!        │  (schema lock)
//!        ▼
//!  switch every tiered: tree ──► WorkQueue ──► storage server
//!                                               │ flush to StorageSource
//!                                               │ (checkpoint + schema lock)
//!                                               │ file: entry removed, object: flush=<now>
//!                                               ▼
//!                                          local removal after retention
//! ```
//!
//! `flush_tier` callers are serialized by the flush lock. A caller first waits
//! for work queued by earlier calls to drain, runs one pass, and with
//! `sync=on` waits again for the work its own pass produced.

mod queue;
mod server;
mod source;
pub(crate) mod switch;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};
use tierdb_core::metrics::Stats;

pub use queue::WorkUnit;
pub use source::{BucketStorage, StorageSource};

pub(crate) use queue::{WorkQueue, WorkTracker};

use crate::connection::ConnectionInner;
use crate::session::Session;

/// Run flag, wake-up signal and join handle of one background thread.
#[derive(Default)]
pub(crate) struct ThreadSignal {
    running: AtomicBool,
    signalled: Mutex<bool>,
    cond: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadSignal {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn signal(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_all();
    }

    /// Sleep for up to `timeout`. Returns whether the thread was signalled.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut signalled = self.signalled.lock();
        if !*signalled && self.is_running() {
            self.cond.wait_for(&mut signalled, timeout);
        }
        std::mem::replace(&mut *signalled, false)
    }

    fn start(&self, name: &str, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.running.store(true, Ordering::Release);
        let handle = thread::Builder::new().name(name.to_string()).spawn(f).map_err(|e| {
            self.running.store(false, Ordering::Release);
            Error::from(e)
        })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.signal();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("background thread exited with a panic");
            }
        }
    }
}

/// Options of one `flush_tier` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTierOptions {
    /// Switch trees even when unmodified.
    pub force: bool,
    /// Wait for this call's work to be flushed.
    pub sync: bool,
    /// Block on the flush and schema locks instead of failing with `Busy`.
    pub lock_wait: bool,
}

impl Default for FlushTierOptions {
    fn default() -> Self {
        Self {
            force: false,
            sync: true,
            lock_wait: true,
        }
    }
}

impl FlushTierOptions {
    pub fn from_config(config: &str) -> Result<Self> {
        let cfg = ConfigString::parse(config)?;
        let mut opts = Self::default();
        if let Some(force) = cfg.get_bool("force") {
            opts.force = force;
        }
        if let Some(sync) = cfg.get_nonempty("sync") {
            opts.sync = match sync.as_str() {
                "on" => true,
                "off" => false,
                other => return Err(Error::invalid(format!("sync: unknown setting '{}'", other))),
            };
        }
        if let Some(lock_wait) = cfg.get_bool("lock_wait") {
            opts.lock_wait = lock_wait;
        }
        Ok(opts)
    }
}

/// Connection-wide tiered storage state.
pub struct TieredManager {
    pub(crate) source: Arc<dyn StorageSource>,
    pub(crate) queue: WorkQueue,
    pub(crate) tracker: Arc<WorkTracker>,
    flush_lock: Mutex<()>,
    pub(crate) server: ThreadSignal,
    pub(crate) manager: ThreadSignal,
    modified: Mutex<HashSet<String>>,
    spin_iterations: u32,
    cond_wait: Duration,
}

impl TieredManager {
    pub(crate) fn new(source: Arc<dyn StorageSource>, stats: Stats, spin_iterations: u32, cond_wait: Duration) -> Self {
        Self {
            source,
            queue: WorkQueue::default(),
            tracker: Arc::new(WorkTracker::new(stats)),
            flush_lock: Mutex::new(()),
            server: ThreadSignal::default(),
            manager: ThreadSignal::default(),
            modified: Mutex::new(HashSet::new()),
            spin_iterations,
            cond_wait,
        }
    }

    /// Start the storage server, then the manager if it has a wait interval.
    pub(crate) fn start(conn: &Arc<ConnectionInner>) -> Result<()> {
        let Some(tiered) = conn.tiered.as_ref() else {
            return Ok(());
        };
        let server_conn = Arc::clone(conn);
        tiered
            .server
            .start("tierdb-storage-server", move || server::storage_server(server_conn))?;

        if conn.config.tiered_manager.enabled() {
            let mgr_conn = Arc::clone(conn);
            tiered
                .manager
                .start("tierdb-storage-mgr", move || server::manager_server(mgr_conn))?;
        }
        info!(
            "tiered storage started, manager={}",
            conn.config.tiered_manager.enabled()
        );
        Ok(())
    }

    /// Stop the storage server (freeing anything still queued), then the
    /// manager.
    pub(crate) fn shutdown(&self) {
        self.tracker.notify();
        self.server.stop();
        let dropped = self.queue.drain();
        if dropped > 0 {
            debug!("freed {} unflushed work units at shutdown", dropped);
        }
        self.manager.stop();
        self.queue.drain();
        self.tracker.notify();
    }

    pub(crate) fn mark_modified(&self, uri: &str) {
        self.modified.lock().insert(uri.to_string());
    }

    pub(crate) fn is_modified(&self, uri: &str) -> bool {
        self.modified.lock().contains(uri)
    }

    pub(crate) fn clear_modified(&self, uri: &str) {
        self.modified.lock().remove(uri);
    }

    /// Queue generation `id` of a tree for flushing and wake the server.
    pub(crate) fn push_work(&self, conn: &ConnectionInner, tiered_uri: &str, id: u32) {
        self.queue.push(WorkUnit::new(&self.tracker, tiered_uri, id));
        conn.stats.record_work_queued();
        self.server.signal();
    }

    /// Work units created but not yet freed.
    pub fn pending(&self) -> u64 {
        self.tracker.pending()
    }

    /// Wait until every queued work unit has been freed: a bounded number of
    /// yields, then timed condition waits. Gives up if the server is gone.
    pub(crate) fn wait_for_drain(&self, conn: &ConnectionInner) -> Result<()> {
        let mut yields = 0u32;
        while self.tracker.pending() > 0 {
            conn.check_panic()?;
            if !self.server.is_running() {
                debug!("storage server not running, not waiting for {} work units", self.pending());
                return Ok(());
            }
            if yields < self.spin_iterations {
                yields += 1;
                thread::yield_now();
                continue;
            }
            let mut guard = self.tracker.flush_mutex.lock();
            if self.tracker.pending() > 0 {
                self.tracker.flush_cond.wait_for(&mut guard, self.cond_wait);
            }
        }
        Ok(())
    }

    /// `flush_tier`: switch every tiered tree and queue the sealed
    /// generations for flushing.
    pub(crate) fn flush_tier(&self, session: &mut Session, opts: FlushTierOptions) -> Result<()> {
        let conn = session.conn_arc();
        conn.stats.record_flush_tier();
        if conn.config.tiered_manager.enabled() {
            return Err(Error::invalid(
                "Cannot call flush_tier when storage manager thread is configured",
            ));
        }

        let result = {
            let _flush = if opts.lock_wait {
                self.flush_lock.lock()
            } else {
                self.flush_lock
                    .try_lock()
                    .ok_or_else(|| Error::busy("flush_tier already in progress"))?
            };

            // Never wait while holding the schema lock: the server needs it.
            self.wait_for_drain(&conn)?;

            let _schema = if opts.lock_wait {
                conn.schema_lock.lock()
            } else {
                conn.schema_lock
                    .try_lock()
                    .ok_or_else(|| Error::busy("schema lock held"))?
            };
            switch::flush_once(session, opts.force)
        };

        if result.is_ok() && opts.sync {
            self.wait_for_drain(&conn)?;
        }
        result
    }
}
