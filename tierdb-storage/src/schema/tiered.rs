//! `tiered:`, `tier:` and `object:` objects.
//!
//! A tiered tree starts with no generations. The first local `file:`
//! generation is created on first write; see [`crate::tiered::switch`].

use tracing::debug;

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};
use tierdb_core::types::{tiered_file_uri, BtreeVersion};

use super::{list_keys, merge_stack, schema_create, without_keys, CREATE_ONLY_KEYS, FILE_META_DEFAULTS};
use crate::session::Session;

/// `object:` entries: one flushed (or flushing) generation.
pub(super) struct ObjectCreator;

impl super::ObjectCreator for ObjectCreator {
    fn create(&self, session: &mut Session, uri: &str, _exclusive: bool, config: &str) -> Result<()> {
        insert_tracked(session, uri, config)
    }
}

/// `tier:` entries.
pub(super) struct TierCreator;

impl super::ObjectCreator for TierCreator {
    fn create(&self, session: &mut Session, uri: &str, _exclusive: bool, config: &str) -> Result<()> {
        insert_tracked(session, uri, config)
    }
}

fn insert_tracked(session: &mut Session, uri: &str, config: &str) -> Result<()> {
    session.conn_arc().metadata.insert(uri, config)?;
    session.track.insert(uri);
    Ok(())
}

pub(super) struct TieredCreator;

impl super::ObjectCreator for TieredCreator {
    fn create(&self, session: &mut Session, uri: &str, exclusive: bool, config: &str) -> Result<()> {
        let conn = session.conn_arc();
        let name = uri
            .strip_prefix("tiered:")
            .ok_or_else(|| Error::invalid(format!("{}: expected a tiered: URI", uri)))?;

        if conn.metadata.exists(uri) {
            if exclusive {
                return Err(Error::exists(uri));
            }
            return Ok(());
        }

        let bucket = conn
            .config
            .tiered_storage
            .as_ref()
            .ok_or_else(|| Error::invalid(format!("{}: tiered storage is not configured", uri)))?;

        if !conn.config.readonly {
            let metadata = match &session.import.list {
                Some(list) => list.find(uri)?.to_string(),
                None => {
                    let version = BtreeVersion::CURRENT;
                    let mut sys = ConfigString::new();
                    sys.set_str("tiered_storage.bucket", bucket.bucket.display().to_string());
                    sys.set_str("tiered_storage.bucket_prefix", bucket.bucket_prefix.clone());
                    sys.set_int("id", conn.allocate_file_id() as i64);
                    sys.set_int("version.major", version.major as i64);
                    sys.set_int("version.minor", version.minor as i64);
                    sys.set_str("checkpoint_lsn", "");
                    let user = without_keys(&ConfigString::parse(config)?, CREATE_ONLY_KEYS).to_string();
                    merge_stack(&[FILE_META_DEFAULTS, &sys.to_string(), &user, "tiers=(),last=0"])?.to_string()
                }
            };
            conn.metadata.insert(uri, &metadata)?;
            session.track.insert(uri);

            if session.import.list.is_some() {
                import_generations(session, name, &metadata)?;
            }
        }

        let guard = conn.dhandles.try_exclusive(uri, session.id())?;
        session.track.handle_lock(guard);
        debug!("created {}", uri);
        Ok(())
    }
}

/// Bring back the flushed objects and the current local generation of an
/// imported tiered tree. The records of the tree itself are not restored.
fn import_generations(session: &mut Session, name: &str, metadata: &str) -> Result<()> {
    let conn = session.conn_arc();
    let cfg = ConfigString::parse(metadata)?;

    for object in list_keys(&cfg, "tiers") {
        let objconf = match &session.import.list {
            Some(list) => list.find(&object)?.to_string(),
            None => continue,
        };
        conn.metadata.insert(&object, &objconf)?;
        session.track.insert(&object);
    }

    let last = cfg.get_int("last").unwrap_or(0);
    if last > 0 {
        let id = u32::try_from(last).map_err(|_| Error::invalid(format!("tiered:{}: bad last id {}", name, last)))?;
        let local = tiered_file_uri(name, id);
        let localconf = match &session.import.list {
            Some(list) => list.find(&local)?.to_string(),
            None => String::new(),
        };
        schema_create(session, &local, &localconf)?;
    }
    Ok(())
}
