//! # Tiered Storage Integration Tests
//!
//! A gated object store holds the storage server inside `flush` so tests can
//! line up work, then release it and observe ordering, freeing, flush_tier
//! serialization and the busy retry of the metadata update.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;

use tierdb_core::{ConfigString, Error, Result};
use tierdb_storage::{BucketStorage, Connection, StorageSource};

struct GatedStorage {
    inner: BucketStorage,
    open: Mutex<bool>,
    cond: Condvar,
    flushed: Mutex<Vec<String>>,
    fail: bool,
}

impl GatedStorage {
    fn new(bucket: &Path, open: bool, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: BucketStorage::new(bucket, "").unwrap(),
            open: Mutex::new(open),
            cond: Condvar::new(),
            flushed: Mutex::new(Vec::new()),
            fail,
        })
    }

    fn release(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    fn flushed(&self) -> Vec<String> {
        self.flushed.lock().clone()
    }
}

impl StorageSource for GatedStorage {
    fn flush(&self, local: &Path, object: &str) -> Result<()> {
        {
            let mut open = self.open.lock();
            while !*open {
                self.cond.wait(&mut open);
            }
        }
        self.flushed.lock().push(object.to_string());
        if self.fail {
            return Err(Error::Storage {
                message: format!("{}: bucket unreachable", object),
            });
        }
        self.inner.flush(local, object)
    }

    fn flush_finish(&self, local: &Path, object: &str) -> Result<()> {
        self.inner.flush_finish(local, object)
    }

    fn exists(&self, object: &str) -> Result<bool> {
        self.inner.exists(object)
    }
}

struct Fixture {
    _dir: TempDir,
    home: PathBuf,
    bucket: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        let bucket = dir.path().join("bucket");
        Self { _dir: dir, home, bucket }
    }

    fn config(&self, extra: &str) -> String {
        let mut config = format!(
            "tiered_storage=(bucket=\"{}\",local_retention=0),flush_wait=(spin_iterations=10,cond_wait=20)",
            self.bucket.display()
        );
        if !extra.is_empty() {
            config.push(',');
            config.push_str(extra);
        }
        config
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

fn tiered_config(conn: &Connection) -> ConfigString {
    ConfigString::parse(&conn.metadata_search("tiered:t").unwrap()).unwrap()
}

#[test]
fn test_tiered_table_layout() {
    let fx = Fixture::new();
    let conn = Connection::open(&fx.home, &fx.config("")).unwrap();
    let mut session = conn.open_session();
    session.create("table:t", "key_format=S,value_format=S").unwrap();

    let colgroup = ConfigString::parse(&conn.metadata_search("colgroup:t").unwrap()).unwrap();
    assert_eq!(colgroup.get_str("source").as_deref(), Some("tiered:t"));
    let tiered = tiered_config(&conn);
    assert_eq!(tiered.get_int("last"), Some(0));
    assert!(tiered.get_int("id").is_some());

    session.insert("table:t", strings(&["k"]), strings(&["v"]), 1).unwrap();
    assert_eq!(tiered_config(&conn).get_int("last"), Some(1));
    let local = ConfigString::parse(&conn.metadata_search("file:t-0000000001.wtobj").unwrap()).unwrap();
    assert_eq!(local.get_bool("tiered_object"), Some(true));
    assert_eq!(session.get("table:t", &strings(&["k"])).unwrap(), Some(strings(&["v"])));
}

#[test]
fn test_tiered_rejects_non_file_type() {
    let fx = Fixture::new();
    let conn = Connection::open(&fx.home, &fx.config("")).unwrap();
    let mut session = conn.open_session();
    let err = session.create("table:t", "key_format=S,value_format=S,type=lsm").unwrap_err();
    assert!(matches!(err, Error::NotSupported { .. }));
    assert!(conn.metadata_list().is_empty());

    // Opting out of tiered storage gives a plain file.
    session
        .create("table:plain", "key_format=S,value_format=S,tiered_storage=(name=none)")
        .unwrap();
    assert!(conn.metadata_search("file:plain.wt").is_ok());
}

#[test]
fn test_flush_tier_moves_generation_to_bucket() {
    let fx = Fixture::new();
    let conn = Connection::open(&fx.home, &fx.config("")).unwrap();
    let mut session = conn.open_session();
    session.create("table:t", "key_format=S,value_format=S").unwrap();
    session.insert("table:t", strings(&["k"]), strings(&["v"]), 1).unwrap();

    session.flush_tier("").unwrap();

    let tiered = tiered_config(&conn);
    assert_eq!(tiered.get_int("last"), Some(2));
    let tiers: Vec<&str> = tiered.get_struct("tiers").unwrap().keys().collect();
    assert_eq!(tiers, vec!["object:t-0000000001.wtobj"]);
    assert!(fx.bucket.join("t-0000000001.wtobj").exists());
    assert!(conn.metadata_search("file:t-0000000001.wtobj").is_err());
    let object = ConfigString::parse(&conn.metadata_search("object:t-0000000001.wtobj").unwrap()).unwrap();
    assert!(object.get_int("flush").is_some());
    assert!(conn.metadata_search("file:t-0000000002.wtobj").is_ok());

    // Retention is zero, so the server removes the local copy.
    wait_until("local removal", || !fx.home.join("t-0000000001.wtobj").exists());
    assert_eq!(conn.stats().local_removals, 1);

    // Nothing changed since; an unforced pass switches nothing.
    session.flush_tier("").unwrap();
    assert_eq!(conn.stats().tier_switches, 1);
    session.flush_tier("force=true").unwrap();
    assert_eq!(conn.stats().tier_switches, 2);
}

#[test]
fn test_flush_tier_option_validation() {
    let fx = Fixture::new();
    let conn = Connection::open(&fx.home, &fx.config("")).unwrap();
    let mut session = conn.open_session();
    let err = session.flush_tier("sync=maybe").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
}

#[test]
fn test_flush_tier_refused_with_manager() {
    let fx = Fixture::new();
    let conn = Connection::open(&fx.home, &fx.config("tiered_manager=(wait=20)")).unwrap();
    let mut session = conn.open_session();
    session.create("table:t", "key_format=S,value_format=S").unwrap();
    let err = session.flush_tier("").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert_eq!(conn.stats().flush_tier, 1);

    // The manager switches modified trees on its own.
    session.insert("table:t", strings(&["k"]), strings(&["v"]), 1).unwrap();
    wait_until("manager switch", || fx.bucket.join("t-0000000001.wtobj").exists());
    assert!(conn.stats().tier_switches >= 1);
}

#[test]
fn test_work_units_flushed_in_order() {
    let fx = Fixture::new();
    let storage = GatedStorage::new(&fx.bucket, false, false);
    let conn = Connection::open_with_source(&fx.home, &fx.config(""), storage.clone()).unwrap();
    let mut session = conn.open_session();
    session.create("table:t", "key_format=S,value_format=S").unwrap();

    for (i, key) in ["a", "b", "c"].iter().enumerate() {
        session.insert("table:t", strings(&[key]), strings(&["v"]), i as u64 + 1).unwrap();
        session.switch_tier("tiered:t", false).unwrap();
    }
    assert_eq!(conn.stats().work_queued, 3);

    storage.release();
    wait_until("queue drain", || conn.tiered_work_pending() == 0);

    assert_eq!(
        storage.flushed(),
        strings(&["t-0000000001.wtobj", "t-0000000002.wtobj", "t-0000000003.wtobj"])
    );
    let stats = conn.stats();
    assert_eq!(stats.work_dequeued, 3);
    assert_eq!(stats.work_freed, 3);
    assert_eq!(stats.work_outstanding(), 0);
}

#[test]
fn test_work_units_freed_once_after_flush_error() {
    let fx = Fixture::new();
    let storage = GatedStorage::new(&fx.bucket, false, true);
    let conn = Connection::open_with_source(&fx.home, &fx.config(""), storage.clone()).unwrap();
    let mut session = conn.open_session();
    session.create("table:t", "key_format=S,value_format=S").unwrap();

    for key in ["a", "b", "c"] {
        session.insert("table:t", strings(&[key]), strings(&["v"]), 1).unwrap();
        session.switch_tier("tiered:t", false).unwrap();
    }

    storage.release();
    wait_until("server failure", || conn.stats().panics == 1);
    assert!(matches!(session.flush_tier(""), Err(Error::Panic { .. })));

    // The failed unit was freed by the server, the rest at close.
    assert!(matches!(conn.close(), Err(Error::Panic { .. })));
    let stats = conn.stats();
    assert_eq!(stats.work_queued, 3);
    assert_eq!(stats.work_dequeued, 1);
    assert_eq!(stats.work_freed, 3);
    assert_eq!(conn.tiered_work_pending(), 0);
    assert_eq!(storage.flushed(), strings(&["t-0000000001.wtobj"]));
}

#[test]
fn test_flush_tier_serialized() {
    let fx = Fixture::new();
    let storage = GatedStorage::new(&fx.bucket, false, false);
    let conn = Connection::open_with_source(&fx.home, &fx.config(""), storage.clone()).unwrap();
    let mut session = conn.open_session();
    session.create("table:t", "key_format=S,value_format=S").unwrap();
    session.insert("table:t", strings(&["k"]), strings(&["v"]), 1).unwrap();

    // Queue a generation the server cannot finish yet.
    session.flush_tier("sync=off").unwrap();
    assert_eq!(conn.tiered_work_pending(), 1);

    // A blocking caller takes the flush lock and waits for the drain.
    let mut waiter = conn.open_session();
    let blocked = thread::spawn(move || waiter.flush_tier("force=true,lock_wait=true"));
    wait_until("second flush_tier", || conn.stats().flush_tier == 2);
    thread::sleep(Duration::from_millis(100));

    let mut other = conn.open_session();
    let err = other.flush_tier("force=true,lock_wait=false").unwrap_err();
    assert!(err.is_busy());
    assert_eq!(conn.stats().tier_switches, 1);

    storage.release();
    blocked.join().unwrap().unwrap();
    assert_eq!(conn.stats().tier_switches, 2);
    assert_eq!(tiered_config(&conn).get_int("last"), Some(3));
}

#[test]
fn test_flush_retries_while_handle_busy() {
    let fx = Fixture::new();
    let storage = GatedStorage::new(&fx.bucket, false, false);
    let conn = Connection::open_with_source(&fx.home, &fx.config(""), storage.clone()).unwrap();
    let mut session = conn.open_session();
    session.create("table:t", "key_format=S,value_format=S").unwrap();
    session.insert("table:t", strings(&["k"]), strings(&["v"]), 1).unwrap();
    session.flush_tier("sync=off").unwrap();

    let holder = conn.open_session();
    let guard = holder.lock_exclusive("tiered:t").unwrap();
    storage.release();
    wait_until("busy retry", || conn.stats().flush_tier_busy >= 1);
    assert!(conn.metadata_search("file:t-0000000001.wtobj").is_ok());

    drop(guard);
    wait_until("queue drain", || conn.tiered_work_pending() == 0);
    assert!(conn.metadata_search("file:t-0000000001.wtobj").is_err());
    assert_eq!(conn.stats().panics, 0);
    assert!(fx.bucket.join("t-0000000001.wtobj").exists());
}

#[test]
fn test_tiered_import_from_metadata_file() {
    let fx = Fixture::new();
    let export = fx.home.parent().unwrap().join("export.txt");
    {
        let conn = Connection::open(&fx.home, &fx.config("")).unwrap();
        let mut session = conn.open_session();
        session.create("table:t", "key_format=S,value_format=S").unwrap();
        session.insert("table:t", strings(&["k"]), strings(&["v"]), 1).unwrap();
        session.flush_tier("").unwrap();
        conn.export_metadata(&export).unwrap();
    }

    let dst = TempDir::new().unwrap();
    let conn = Connection::open(dst.path(), &fx.config("")).unwrap();
    let mut session = conn.open_session();
    let err = session
        .create("table:t", "import=(enabled=true,file_metadata=(id=1))")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));

    let config = format!("import=(enabled=true,metadata_file=\"{}\")", export.display());
    session.create("table:t", &config).unwrap();

    let tiered = tiered_config(&conn);
    assert_eq!(tiered.get_int("last"), Some(2));
    assert!(conn.metadata_search("object:t-0000000001.wtobj").is_ok());
    assert!(conn.metadata_search("file:t-0000000002.wtobj").is_ok());
    assert!(dst.path().join("t-0000000002.wtobj").exists());
}
