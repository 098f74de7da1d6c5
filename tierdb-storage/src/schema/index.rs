//! `index:` objects. An index source's key is the indexed columns followed by
//! whatever primary key columns they do not already include; its value is
//! empty.

use tracing::debug;

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};
use tierdb_core::types::TS_NONE;

use super::table::TableSchema;
use super::{list_keys, merge_stack, retain_keys, schema_create, ObjectCreator, INDEX_META_DEFAULTS};
use crate::connection::ConnectionInner;
use crate::format::column_count;
use crate::session::Session;

const INDEX_KEYS: &[&str] = &[
    "app_metadata",
    "collator",
    "columns",
    "extractor",
    "immutable",
    "index_key_columns",
    "key_format",
    "source",
    "type",
    "value_format",
];

#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub uri: String,
    pub name: String,
    pub source: String,
    /// Columns named by the application.
    pub columns: Vec<String>,
    /// Primary key columns appended to make index keys unique.
    pub extra_columns: Vec<String>,
    /// Custom extractor indexes are not maintained by the engine.
    pub extractor: bool,
}

impl IndexSchema {
    pub(crate) fn from_config(uri: &str, cfg: &ConfigString, key_columns: &[String]) -> Result<Self> {
        let name = uri.rsplit(':').next().unwrap_or_default().to_string();
        let source = cfg
            .get_nonempty("source")
            .ok_or_else(|| Error::invalid(format!("{}: index has no source", uri)))?;
        let columns = list_keys(cfg, "columns");
        let extra_columns = key_columns.iter().filter(|c| !columns.contains(c)).cloned().collect();
        Ok(Self {
            uri: uri.to_string(),
            name,
            source,
            columns,
            extra_columns,
            extractor: has_extractor(cfg),
        })
    }

    /// Index key of a table row.
    pub fn key_of(&self, table: &TableSchema, key: &[String], values: &[String]) -> Result<Vec<String>> {
        let mut out = table.project(key, values, &self.columns)?;
        out.extend(table.project(key, values, &self.extra_columns)?);
        Ok(out)
    }
}

fn has_extractor(cfg: &ConfigString) -> bool {
    matches!(cfg.get_nonempty("extractor").as_deref(), Some(e) if e != "none")
}

pub(super) struct IndexCreator;

impl ObjectCreator for IndexCreator {
    fn create(&self, session: &mut Session, name: &str, exclusive: bool, config: &str) -> Result<()> {
        let conn = session.conn_arc();
        let rest = name
            .strip_prefix("index:")
            .ok_or_else(|| Error::invalid(format!("{}: expected an index: URI", name)))?;
        let (tablename, idxname) = rest.split_once(':').ok_or_else(|| {
            Error::invalid(format!("Invalid index name, should be <table name>:<index name>: {}", name))
        })?;
        let table_uri = format!("table:{}", tablename);

        let table = TableSchema::load(&conn, &table_uri).map_err(|e| match e {
            Error::NotFound { .. } => Error::no_entry(format!(
                "Can't create an index for a non-existent table: {}",
                tablename
            )),
            other => other,
        })?;
        // Waits out anyone holding the table; the lock is not kept.
        drop(conn.dhandles.try_exclusive(&table_uri, session.id())?);

        if table.is_simple() {
            return Err(Error::invalid(format!("{} requires a table with named columns", name)));
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
                let source = index_source(&table, idxname, &user);
                extra.set_str("source", source.clone());
                source
            }
        };

        let extractor = has_extractor(&user);
        let extractor_key = if extractor {
            Some(user.get_nonempty("key_format").ok_or_else(|| {
                Error::invalid(format!("{}: custom extractors require a key_format", name))
            })?)
        } else {
            None
        };

        let icols = list_keys(&user, "columns");
        if !user.contains("columns") && !extractor {
            return Err(Error::invalid(format!("{}: requires 'columns' configuration", name)));
        }

        let npublic = match &extractor_key {
            Some(kf) => column_count(kf)?,
            None => icols.len(),
        };

        let mut extra_cols = Vec::new();
        for pk in &table.key_columns {
            if icols.contains(pk) {
                if extractor {
                    return Err(Error::invalid(
                        "an index with a custom extractor may not include primary key columns",
                    ));
                }
                continue;
            }
            extra_cols.push(pk.clone());
        }

        let mut key_format = extractor_key.unwrap_or_default();
        if !extractor {
            for col in &icols {
                key_format.push_str(&table.column_format(col)?);
            }
        }
        for col in &extra_cols {
            key_format.push_str(&table.column_format(col)?);
        }
        if key_format == "r" {
            return Err(Error::invalid(
                "column-store index may not use the record number as its index key",
            ));
        }

        let mut fmt = ConfigString::new();
        fmt.set_str("value_format", "");
        fmt.set_str("key_format", key_format);
        fmt.set_int("index_key_columns", npublic as i64);
        let mut sourceconf = user.clone();
        sourceconf.merge(&fmt);
        let sourceconf = sourceconf.to_string();

        schema_create(session, &source, &sourceconf)?;

        let mut idxconf = merge_stack(&[INDEX_META_DEFAULTS, &sourceconf])?;
        idxconf.merge(&extra);
        let idxconf = retain_keys(&idxconf, INDEX_KEYS);

        if !exists {
            conn.metadata.insert(name, &idxconf.to_string())?;
            session.track.insert(name);

            let index = IndexSchema::from_config(name, &idxconf, &table.key_columns)?;
            fill_index(&conn, session, &table, &index)?;
        }
        Ok(())
    }
}

/// `<type>:t_i_idx` for a non-file type, otherwise `file:t_i.wti`.
fn index_source(table: &TableSchema, idxname: &str, cfg: &ConfigString) -> String {
    match cfg.get_nonempty("type") {
        Some(ty) if ty != "file" => format!("{}:{}_{}_idx", ty, table.name, idxname),
        _ => format!("file:{}_{}.wti", table.name, idxname),
    }
}

/// Populate a new index from existing rows. Until every column group exists
/// the table cannot hold data, so there is nothing to do.
fn fill_index(conn: &ConnectionInner, session: &mut Session, table: &TableSchema, index: &IndexSchema) -> Result<()> {
    if !table.cg_complete || index.extractor {
        return Ok(());
    }
    let rows = table.rows(conn);
    for (key, values) in &rows {
        let row = conn.records.get(&table.colgroups[0].source, key);
        let ts = row.map(|r| r.start_ts).unwrap_or(TS_NONE);
        conn.records.insert(&index.source, index.key_of(table, key, values)?, Vec::new(), ts);
    }
    if !rows.is_empty() {
        session.track.records(&index.source);
    }
    debug!("filled index {} with {} rows", index.uri, rows.len());
    Ok(())
}
