//! `lsm:` trees. Only creation is handled here: a tree record listing its
//! chunks and the first chunk file.

use tracing::debug;

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};

use super::{list_value, merge_stack, schema_create, without_keys, ObjectCreator, CREATE_ONLY_KEYS, SESSION_CREATE_DEFAULTS};
use crate::session::Session;

/// URI of chunk `id` of an LSM tree.
pub fn lsm_chunk_uri(name: &str, id: u32) -> String {
    format!("file:{}-{:06}.lsm", name, id)
}

pub(super) struct LsmCreator;

impl ObjectCreator for LsmCreator {
    fn create(&self, session: &mut Session, uri: &str, exclusive: bool, config: &str) -> Result<()> {
        let conn = session.conn_arc();
        let name = uri
            .strip_prefix("lsm:")
            .ok_or_else(|| Error::invalid(format!("{}: expected an lsm: URI", uri)))?;

        if conn.metadata.exists(uri) {
            if exclusive {
                return Err(Error::exists(uri));
            }
            return Ok(());
        }

        let user = without_keys(&ConfigString::parse(config)?, CREATE_ONLY_KEYS).to_string();
        let mut treeconf = merge_stack(&[SESSION_CREATE_DEFAULTS, &user])?;

        let chunk = lsm_chunk_uri(name, 1);
        let mut chunkconf = ConfigString::new();
        for key in ["key_format", "value_format"] {
            if let Some(v) = treeconf.get_str(key) {
                chunkconf.set_str(key, v);
            }
        }
        schema_create(session, &chunk, &chunkconf.to_string())?;

        treeconf.set("chunks", list_value(&[chunk.as_str()]));
        treeconf.set_int("last", 1);
        conn.metadata.insert(uri, &treeconf.to_string())?;
        session.track.insert(uri);
        debug!("created {} with chunk {}", uri, chunk);
        Ok(())
    }
}
