//! Background threads: the storage server that copies queued generations to
//! the object store, and the optional manager that switches every tiered tree
//! on a fixed interval.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};
use tierdb_core::types::{tiered_file_uri, tiered_object_uri};
use tierdb_core::utils::{now_secs, retry_with_backoff, Backoff};

use super::queue::WorkUnit;
use super::switch::flush_once;
use super::TieredManager;
use crate::connection::ConnectionInner;
use crate::meta_track::MetaTrack;
use crate::session::Session;

pub(super) fn storage_server(conn: Arc<ConnectionInner>) {
    let Some(tiered) = conn.tiered.as_ref() else {
        return;
    };
    let session = Session::internal(Arc::clone(&conn));
    let interval = conn.config.tiered_server_interval;
    info!("storage server started");

    let mut time_start = Instant::now();
    loop {
        let signalled = tiered.server.wait(interval);
        if !tiered.server.is_running() {
            break;
        }

        let time_stop = Instant::now();
        if time_stop.duration_since(time_start) >= interval || signalled {
            let result = storage_copy(&conn, tiered, &session).and_then(|_| remove_local(&conn, false));
            if let Err(e) = result {
                error!("storage server error: {}", e);
                conn.set_panic(format!("storage server error: {}", e));
                break;
            }
        }
        time_start = time_stop;
    }
    info!("storage server stopped");
}

pub(super) fn manager_server(conn: Arc<ConnectionInner>) {
    let Some(tiered) = conn.tiered.as_ref() else {
        return;
    };
    let mut session = Session::internal(Arc::clone(&conn));
    let wait = conn.config.tiered_manager.wait;
    info!("tiered manager started, wait={:?}", wait);

    loop {
        tiered.manager.wait(wait);
        if !tiered.manager.is_running() {
            break;
        }

        let result = {
            let _schema = conn.schema_lock.lock();
            flush_once(&mut session, false)
        };
        let result = result
            .and_then(|_| tiered.wait_for_drain(&conn))
            .and_then(|_| remove_local(&conn, false));
        if let Err(e) = result {
            error!("tiered manager error: {}", e);
            conn.set_panic(format!("tiered manager error: {}", e));
            break;
        }
    }
    info!("tiered manager stopped");
}

/// Flush queued work units until the queue is empty. A unit is freed when it
/// goes out of scope, including on error.
fn storage_copy(conn: &ConnectionInner, tiered: &TieredManager, session: &Session) -> Result<()> {
    while let Some(unit) = tiered.queue.pop() {
        conn.stats.record_work_dequeued();
        flush_unit(conn, tiered, session, &unit)?;
    }
    Ok(())
}

fn flush_unit(conn: &ConnectionInner, tiered: &TieredManager, session: &Session, unit: &WorkUnit) -> Result<()> {
    let name = unit
        .tiered_uri
        .strip_prefix("tiered:")
        .ok_or_else(|| Error::invalid(format!("{}: expected a tiered: URI", unit.tiered_uri)))?;
    let local_uri = tiered_file_uri(name, unit.id);
    let object_uri = tiered_object_uri(name, unit.id);
    do_flush(conn, tiered, session, &unit.tiered_uri, &local_uri, &object_uri)
}

/// Copy one generation to the object store and swap its metadata from the
/// local file to the object.
pub(crate) fn do_flush(
    conn: &ConnectionInner,
    tiered: &TieredManager,
    session: &Session,
    tiered_uri: &str,
    local_uri: &str,
    object_uri: &str,
) -> Result<()> {
    let local_name = local_uri
        .strip_prefix("file:")
        .ok_or_else(|| Error::invalid(format!("{}: expected a file: URI", local_uri)))?;
    let object_name = object_uri
        .strip_prefix("object:")
        .ok_or_else(|| Error::invalid(format!("{}: expected an object: URI", object_uri)))?;
    let local_path = conn.fs().path(local_name);

    // May be slow and may fail on the network; not retried here.
    tiered.source.flush(&local_path, object_name)?;

    // The tiered handle may be held by whoever queued this unit.
    retry_with_backoff(
        Backoff::default(),
        || {
            let _ckpt = conn.checkpoint_lock.lock();
            let _schema = conn.schema_lock.lock();
            flush_meta(conn, session, tiered_uri, local_uri, object_uri)
        },
        Error::is_busy,
        |delay| {
            conn.stats.record_flush_tier_busy();
            debug!("{}: handle busy, retrying metadata update in {:?}", tiered_uri, delay);
        },
    )?;

    tiered.source.flush_finish(&local_path, object_name)?;
    debug!("flushed {} to {}", local_uri, object_uri);
    Ok(())
}

/// Remove the `file:` entry and mark the `object:` entry flushed, as one
/// tracked change.
fn flush_meta(
    conn: &ConnectionInner,
    session: &Session,
    tiered_uri: &str,
    local_uri: &str,
    object_uri: &str,
) -> Result<()> {
    let mut track = MetaTrack::new();
    track.on();
    let result = (|| -> Result<()> {
        let guard = conn.dhandles.try_exclusive(tiered_uri, session.id())?;
        track.handle_lock(guard);

        let removed = conn.metadata.remove(local_uri)?;
        track.remove(local_uri, removed);

        let mut objconf = ConfigString::parse(&conn.metadata.search(object_uri)?)?;
        objconf.set_int("flush", now_secs() as i64);
        let previous = conn.metadata.update(object_uri, &objconf.to_string())?;
        track.update(object_uri, previous);
        Ok(())
    })();
    let off = track.off(conn, result.is_err());
    result.and(off)
}

/// Remove local copies of flushed generations once their retention has
/// passed, or all of them when forced.
pub(crate) fn remove_local(conn: &ConnectionInner, force: bool) -> Result<()> {
    let retention = conn
        .config
        .tiered_storage
        .as_ref()
        .map(|t| t.local_retention)
        .unwrap_or(0);
    let now = now_secs();

    for (object_uri, config) in conn.metadata.scan_prefix("object:") {
        let Some(flushed) = ConfigString::parse(&config)?.get_int("flush") else {
            continue;
        };
        let name = object_uri.trim_start_matches("object:");
        if conn.metadata.exists(&format!("file:{}", name)) || !conn.fs().exists(name)? {
            continue;
        }
        let expired = (flushed.max(0) as u64).saturating_add(retention) <= now;
        if force || expired {
            conn.fs().remove(name)?;
            conn.dhandles.discard(&format!("file:{}", name));
            conn.stats.record_local_removal();
            debug!("removed local copy {}, local retention expired", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use tempfile::TempDir;

    const OBJECT: &str = "t-0000000001.wtobj";

    fn flushed_at(conn: &ConnectionInner, secs: u64) {
        let uri = format!("object:{}", OBJECT);
        conn.metadata.update(&uri, &format!("flush={}", secs)).unwrap();
    }

    #[test]
    fn test_local_copy_kept_until_retention_passes() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        let config = format!(
            "tiered_storage=(bucket=\"{}\",local_retention=3600)",
            dir.path().join("bucket").display()
        );
        let conn = Connection::open(&home, &config).unwrap();
        let inner = conn.inner();
        std::fs::write(home.join(OBJECT), b"generation").unwrap();

        // Flushed a minute ago: still inside the window.
        flushed_at(inner, now_secs() - 60);
        remove_local(inner, false).unwrap();
        assert!(home.join(OBJECT).exists());
        assert_eq!(conn.stats().local_removals, 0);

        // Flushed two hours ago: the window has passed.
        flushed_at(inner, now_secs() - 7200);
        remove_local(inner, false).unwrap();
        assert!(!home.join(OBJECT).exists());
        assert_eq!(conn.stats().local_removals, 1);
    }

    #[test]
    fn test_forced_removal_ignores_retention() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        let config = format!(
            "tiered_storage=(bucket=\"{}\",local_retention=3600)",
            dir.path().join("bucket").display()
        );
        let conn = Connection::open(&home, &config).unwrap();
        let inner = conn.inner();
        std::fs::write(home.join(OBJECT), b"generation").unwrap();
        flushed_at(inner, now_secs());

        // A generation with a live `file:` entry is never removed.
        inner.metadata.insert(&format!("file:{}", OBJECT), "id=1").unwrap();
        remove_local(inner, true).unwrap();
        assert!(home.join(OBJECT).exists());

        inner.metadata.remove(&format!("file:{}", OBJECT)).unwrap();
        remove_local(inner, true).unwrap();
        assert!(!home.join(OBJECT).exists());
        assert_eq!(conn.stats().local_removals, 1);
    }
}
