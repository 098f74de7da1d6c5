//! # Schema Creation
//!
//! `create(uri, config)` dispatches on the URI namespace to a type-specific
//! [`ObjectCreator`]. Everything a creator does to metadata and the file
//! system is tracked, so a failure anywhere in a compound create (a table and
//! its column groups and their files) backs the whole object out.
//!
//! ```text
//! table:t ──► colgroup:t[:cg] ──► file:t[_cg].wt | tiered:t[_cg] | <type>:t[_cg]
//! index:t:i ──► file:t_i.wti
//! tiered:t ──► file:t-0000000001.wtobj ──► object:t-0000000001.wtobj (on switch)
//! ```
//!
//! Imports run through the same creators. An import context set by the
//! outermost call is visible to the recursive calls it makes, and only the call
//! that set it clears it.

mod colgroup;
mod data_source;
mod file;
mod import;
mod index;
mod lsm;
mod table;
mod tiered;

use std::path::Path;

use tracing::debug;

use tierdb_core::config_string::{ConfigString, ConfigValue};
use tierdb_core::error::{Error, Result};
use tierdb_core::types::ObjectKind;

use crate::connection::ConnectionInner;
use crate::session::Session;

pub use data_source::DataSource;
pub use import::{ImportEntry, ImportList};
pub use index::IndexSchema;
pub use table::{load_table, ColgroupSchema, TableSchema};

pub(crate) use colgroup::create_colgroup;

pub(crate) const FILE_META_DEFAULTS: &str = "allocation_size=4KB,app_metadata=,checksum=on,collator=,columns=,\
format=btree,key_format=u,value_format=u,leaf_page_max=32KB,internal_page_max=4KB";
pub(crate) const COLGROUP_META_DEFAULTS: &str = "app_metadata=,collator=,columns=,source=,type=file";
pub(crate) const INDEX_META_DEFAULTS: &str = "app_metadata=,collator=,columns=,extractor=none,immutable=false,\
index_key_columns=0,key_format=u,source=,type=file,value_format=u";
pub(crate) const TABLE_META_DEFAULTS: &str = "app_metadata=,colgroups=,collator=,columns=,key_format=u,value_format=u";
pub(crate) const SESSION_CREATE_DEFAULTS: &str = "key_format=u,value_format=u";

/// Options consumed by `create` itself and never stored in metadata.
pub(crate) const CREATE_ONLY_KEYS: &[&str] = &["exclusive", "import", "source", "type"];

/// Creation handler for one URI namespace.
pub(crate) trait ObjectCreator {
    fn create(&self, session: &mut Session, uri: &str, exclusive: bool, config: &str) -> Result<()>;
}

fn builtin_creator(kind: &ObjectKind) -> Option<&'static dyn ObjectCreator> {
    Some(match kind {
        ObjectKind::Colgroup => &colgroup::ColgroupCreator,
        ObjectKind::File => &file::FileCreator,
        ObjectKind::Lsm => &lsm::LsmCreator,
        ObjectKind::Index => &index::IndexCreator,
        ObjectKind::Object => &tiered::ObjectCreator,
        ObjectKind::Table => &table::TableCreator,
        ObjectKind::Tier => &tiered::TierCreator,
        ObjectKind::Tiered => &tiered::TieredCreator,
        ObjectKind::Custom(_) => return None,
    })
}

/// Import state shared by a top-level create and its recursive calls.
#[derive(Debug, Default)]
pub struct ImportContext {
    pub(crate) active: bool,
    pub(crate) list: Option<ImportList>,
}

/// Create any schema object. The caller holds the schema lock.
pub(crate) fn schema_create(session: &mut Session, uri: &str, config: &str) -> Result<()> {
    let conn = session.conn_arc();
    let cfg = ConfigString::parse(config)?;

    let exclusive = cfg.get_bool("exclusive").unwrap_or(false);
    let import = session.import.list.is_some() || cfg.get_bool("import.enabled").unwrap_or(false);
    let kind = ObjectKind::from_uri(uri)?;

    config_check(&conn, session, uri, &cfg, import)?;

    session.track.on();

    let mut clear_import = false;
    let mut list_set = false;
    let mut result = Ok(());
    if import {
        if !session.import.active {
            session.import.active = true;
            clear_import = true;
        }
        if session.import.list.is_none() {
            if let Some(export_file) = cfg.get_nonempty("import.metadata_file") {
                match ImportList::parse(Path::new(&export_file), uri, &conn.next_file_id) {
                    Ok(list) => {
                        session.import.list = Some(list);
                        list_set = true;
                    }
                    Err(e) => result = Err(e),
                }
            }
        }
    }

    if result.is_ok() {
        debug!("create {} exclusive={} import={}", uri, exclusive, import);
        result = dispatch(session, &conn, &kind, uri, exclusive, config);
    }

    if clear_import {
        session.import.active = false;
    }
    let off = session.track.off(&conn, result.is_err());
    if list_set {
        session.import.list = None;
    }
    result.and(off)
}

fn dispatch(
    session: &mut Session,
    conn: &ConnectionInner,
    kind: &ObjectKind,
    uri: &str,
    exclusive: bool,
    config: &str,
) -> Result<()> {
    if let Some(creator) = builtin_creator(kind) {
        return creator.create(session, uri, exclusive, config);
    }
    match conn.data_source(kind.prefix()) {
        Some(source) => data_source::create_data_source(source.as_ref(), uri, config),
        None => Err(Error::invalid(format!("unknown object type: {}", uri))),
    }
}

/// Reject invalid option combinations before anything is changed.
fn config_check(conn: &ConnectionInner, session: &Session, uri: &str, cfg: &ConfigString, import: bool) -> Result<()> {
    let file_metadata = cfg
        .get("import.file_metadata")
        .map(|v| !v.is_empty() && v.as_bool() != Some(false))
        .unwrap_or(false);

    if import && session.import.list.is_none() && !uri.starts_with("file:") && !uri.starts_with("table:") {
        return Err(Error::not_supported(format!(
            "{}: import is only supported for 'file' and 'table' data sources",
            uri
        )));
    }

    let is_tiered = is_tiered_create(conn, cfg);
    if is_tiered && file_metadata {
        return Err(Error::invalid(
            "import for tiered storage is incompatible with the 'file_metadata' setting",
        ));
    }
    if is_tiered {
        if let Some(ty) = cfg.get_nonempty("type") {
            if ty != "file" {
                return Err(Error::not_supported(format!(
                    "unsupported type configuration: {}: type must be file for tiered storage",
                    ty
                )));
            }
        }
    }
    Ok(())
}

/// Tiered storage is on for the connection and not switched off for this object.
pub(crate) fn is_tiered_create(conn: &ConnectionInner, cfg: &ConfigString) -> bool {
    conn.config.tiered_enabled() && cfg.get_nonempty("tiered_storage.name").as_deref() != Some("none")
}

/// Merge a stack of configuration strings, later entries winning.
pub(crate) fn merge_stack(stack: &[&str]) -> Result<ConfigString> {
    let mut merged = ConfigString::new();
    for cfg in stack {
        merged.merge(&ConfigString::parse(cfg)?);
    }
    Ok(merged)
}

/// Keep only the listed top-level keys.
pub(crate) fn retain_keys(cfg: &ConfigString, keys: &[&str]) -> ConfigString {
    filter_keys(cfg, |k| keys.contains(&k))
}

/// Drop the listed top-level keys.
pub(crate) fn without_keys(cfg: &ConfigString, keys: &[&str]) -> ConfigString {
    filter_keys(cfg, |k| !keys.contains(&k))
}

fn filter_keys(cfg: &ConfigString, keep: impl Fn(&str) -> bool) -> ConfigString {
    let mut out = ConfigString::new();
    for (key, value) in cfg.iter() {
        if keep(key) {
            out.insert_raw(key, value.clone());
        }
    }
    out
}

/// Names of a bare-key list such as `columns=(a,b,c)`; empty when unset.
pub(crate) fn list_keys(cfg: &ConfigString, key: &str) -> Vec<String> {
    match cfg.get(key) {
        Some(ConfigValue::Struct(list)) => list.keys().map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// A `(a,b,c)` list value.
pub(crate) fn list_value<S: AsRef<str>>(items: &[S]) -> ConfigValue {
    let mut list = ConfigString::new();
    for item in items {
        list.insert_raw(item.as_ref(), ConfigValue::Key);
    }
    ConfigValue::Struct(list)
}
