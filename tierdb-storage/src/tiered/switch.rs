//! Tier switching: seal the current local generation of a tiered tree, record
//! it as an object awaiting flush and start a new local generation.

use tracing::debug;

use tierdb_core::config_string::{ConfigString, ConfigValue};
use tierdb_core::error::{Error, Result};
use tierdb_core::types::{tiered_file_uri, tiered_object_uri};
use tierdb_core::utils::now_secs;

use crate::block::checkpoint_config;
use crate::schema::{list_keys, list_value, schema_create};
use crate::session::Session;

struct TieredState {
    name: String,
    config: ConfigString,
    last: u32,
}

fn load(session: &Session, uri: &str) -> Result<TieredState> {
    let name = uri
        .strip_prefix("tiered:")
        .ok_or_else(|| Error::invalid(format!("{}: expected a tiered: URI", uri)))?;
    let config = ConfigString::parse(&session.conn().metadata.search(uri)?)?;
    let last = config.get_int("last").unwrap_or(0);
    let last = u32::try_from(last).map_err(|_| Error::invalid(format!("{}: bad last id {}", uri, last)))?;
    Ok(TieredState {
        name: name.to_string(),
        config,
        last,
    })
}

/// Configuration of a local generation file.
fn local_config(tiered: &ConfigString) -> String {
    let mut c = ConfigString::new();
    for key in ["allocation_size", "key_format", "value_format"] {
        if let Some(v) = tiered.get(key) {
            c.set(key, v.clone());
        }
    }
    c.set("tiered_object", ConfigValue::Bool(true));
    c.to_string()
}

/// Rewrite the tiered tree's metadata, tracked.
fn update_tiered(session: &mut Session, uri: &str, config: &ConfigString) -> Result<()> {
    let previous = session.conn().metadata.update(uri, &config.to_string())?;
    session.track.update(uri, previous);
    Ok(())
}

/// Create the first local generation if the tree has none. The caller holds
/// the schema lock.
pub(crate) fn ensure_current(session: &mut Session, uri: &str) -> Result<()> {
    let state = load(session, uri)?;
    if state.last != 0 {
        return Ok(());
    }

    session.track.on();
    let result = (|| -> Result<()> {
        schema_create(session, &tiered_file_uri(&state.name, 1), &local_config(&state.config))?;
        let mut config = state.config.clone();
        config.set_int("last", 1);
        update_tiered(session, uri, &config)
    })();
    let conn = session.conn_arc();
    let off = session.track.off(&conn, result.is_err());
    result.and(off)?;
    debug!("{}: first local generation created", uri);
    Ok(())
}

/// Switch to a new local generation and queue the old one for flushing.
/// Unmodified trees are left alone unless `force` is set. The caller holds the
/// schema lock.
pub(crate) fn switch(session: &mut Session, uri: &str, force: bool) -> Result<()> {
    let conn = session.conn_arc();
    let tiered = conn
        .tiered
        .as_ref()
        .ok_or_else(|| Error::invalid("tiered storage is not configured"))?;

    let state = load(session, uri)?;
    if state.last == 0 {
        // Never written to; there is nothing to seal.
        return Ok(());
    }
    if !force && !tiered.is_modified(uri) {
        debug!("{}: unmodified, not switching", uri);
        return Ok(());
    }

    let sealed = state.last;
    session.track.on();
    let result = (|| -> Result<()> {
        let guard = conn.dhandles.try_exclusive(uri, session.id())?;
        session.track.handle_lock(guard);

        // Seal the current generation with everything written so far.
        let local_uri = tiered_file_uri(&state.name, sealed);
        let local_name = local_uri.trim_start_matches("file:");
        let ckpt = conn.blocks.checkpoint(local_name, conn.records.rows(uri), now_secs())?;
        let mut local_cfg = ConfigString::parse(&conn.metadata.search(&local_uri)?)?;
        local_cfg.remove("checkpoint");
        local_cfg.set("checkpoint", checkpoint_config(std::slice::from_ref(&ckpt)));
        let previous = conn.metadata.update(&local_uri, &local_cfg.to_string())?;
        session.track.update(&local_uri, previous);

        let object_uri = tiered_object_uri(&state.name, sealed);
        schema_create(session, &object_uri, &local_cfg.to_string())?;

        let next = sealed
            .checked_add(1)
            .ok_or_else(|| Error::invalid(format!("{}: generation ids exhausted", uri)))?;
        schema_create(session, &tiered_file_uri(&state.name, next), &local_config(&state.config))?;

        let mut tiers = list_keys(&state.config, "tiers");
        tiers.push(object_uri);
        let mut config = state.config.clone();
        config.remove("tiers");
        config.set("tiers", list_value(&tiers));
        config.set_int("last", next as i64);
        update_tiered(session, uri, &config)
    })();
    let off = session.track.off(&conn, result.is_err());
    result.and(off)?;

    tiered.clear_modified(uri);
    tiered.push_work(&conn, uri, sealed);
    conn.stats.record_tier_switch();
    debug!("{}: switched from generation {} to {}", uri, sealed, sealed + 1);
    Ok(())
}

/// One pass over every tiered tree. The caller holds the schema lock.
pub(crate) fn flush_once(session: &mut Session, force: bool) -> Result<()> {
    let conn = session.conn_arc();
    for (uri, _) in conn.metadata.scan_prefix("tiered:") {
        debug!("flush_tier_once: {}", uri);
        switch(session, &uri, force)?;
    }
    Ok(())
}
