//! `colgroup:` objects: a set of a table's value columns stored in one source.

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};

use super::table::TableSchema;
use super::{is_tiered_create, list_keys, merge_stack, retain_keys, schema_create, ObjectCreator, COLGROUP_META_DEFAULTS};
use crate::connection::ConnectionInner;
use crate::session::Session;

const COLGROUP_KEYS: &[&str] = &["app_metadata", "collator", "columns", "source", "type"];

pub(super) struct ColgroupCreator;

impl ObjectCreator for ColgroupCreator {
    fn create(&self, session: &mut Session, uri: &str, exclusive: bool, config: &str) -> Result<()> {
        create_colgroup(session, uri, exclusive, config)
    }
}

/// Create a column group. Tables call this directly for their default group.
pub(crate) fn create_colgroup(session: &mut Session, name: &str, exclusive: bool, config: &str) -> Result<()> {
    let conn = session.conn_arc();

    let base = match &session.import.list {
        Some(list) => list.find(name)?.to_string(),
        None => config.to_string(),
    };

    let rest = name
        .strip_prefix("colgroup:")
        .ok_or_else(|| Error::invalid(format!("{}: expected a colgroup: URI", name)))?;
    let (tablename, cgname) = match rest.split_once(':') {
        Some((t, cg)) => (t, Some(cg)),
        None => (rest, None),
    };
    let table_uri = format!("table:{}", tablename);

    let table = TableSchema::load(&conn, &table_uri).map_err(|e| match e {
        Error::NotFound { .. } => Error::no_entry(format!(
            "Can't create '{}' for non-existent table '{}'",
            name, tablename
        )),
        other => other,
    })?;
    let guard = conn.dhandles.try_exclusive(&table_uri, session.id())?;
    session.track.handle_lock(guard);

    if let Some(cg) = cgname {
        if !table.colgroup_names.iter().any(|n| n == cg) {
            return Err(Error::invalid(format!(
                "Column group '{}' not found in table '{}'",
                cg, tablename
            )));
        }
    }

    let exists = conn.metadata.exists(name);
    if exists && exclusive {
        return Err(Error::exists(name));
    }

    let user = ConfigString::parse(config)?;
    let mut extra = ConfigString::new();
    let source = match user.get_nonempty("source") {
        Some(source) => source,
        None => {
            let source = colgroup_source(&conn, &table, cgname, &user);
            extra.set_str("source", source.clone());
            source
        }
    };

    let sourceconf = match &session.import.list {
        // Exported source metadata carries its own formats.
        Some(list) => merge_stack(&[list.find(&source)?])?,
        None => {
            let mut fmt = ConfigString::new();
            fmt.set_str("key_format", table.key_format.clone());
            match cgname {
                None => fmt.set_str("value_format", table.value_format.clone()),
                Some(_) => {
                    let columns = list_keys(&user, "columns");
                    if !user.contains("columns") {
                        return Err(Error::invalid(format!("No 'columns' configuration for '{}'", name)));
                    }
                    fmt.set_str("value_format", table.value_format_of(&columns)?);
                }
            }
            let mut merged = user.clone();
            merged.merge(&fmt);
            merged
        }
    };
    schema_create(session, &source, &sourceconf.to_string())?;

    let mut cgconf = merge_stack(&[COLGROUP_META_DEFAULTS, &base])?;
    cgconf.merge(&extra);
    let cgconf = retain_keys(&cgconf, COLGROUP_KEYS).to_string();
    if !exists {
        conn.metadata.insert(name, &cgconf)?;
        session.track.insert(name);
    }
    Ok(())
}

/// Default source of a column group: `<type>:t[_cg]` for a non-file type,
/// `file:t[_cg].wt` without tiered storage, `tiered:t[_cg]` otherwise.
fn colgroup_source(conn: &ConnectionInner, table: &TableSchema, cgname: Option<&str>, cfg: &ConfigString) -> String {
    let (prefix, suffix) = match cfg.get_nonempty("type") {
        Some(ty) if ty != "file" => (ty, ""),
        _ if !is_tiered_create(conn, cfg) => ("file".to_string(), ".wt"),
        _ => ("tiered".to_string(), ""),
    };
    match cgname {
        None => format!("{}:{}{}", prefix, table.name, suffix),
        Some(cg) => format!("{}:{}_{}{}", prefix, table.name, cg, suffix),
    }
}
