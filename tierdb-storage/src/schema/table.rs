//! `table:` objects and the in-memory view of a table's schema.

use tracing::debug;

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};

use super::colgroup::create_colgroup;
use super::index::IndexSchema;
use super::{list_keys, merge_stack, retain_keys, ObjectCreator, FILE_META_DEFAULTS, TABLE_META_DEFAULTS};
use crate::connection::ConnectionInner;
use crate::format::{check_format, column_count, column_fields};
use crate::session::Session;

const TABLE_KEYS: &[&str] = &["app_metadata", "colgroups", "collator", "columns", "key_format", "value_format"];

#[derive(Debug, Clone)]
pub struct ColgroupSchema {
    pub uri: String,
    pub source: String,
    /// Value columns stored in this group; empty for the default group of a
    /// table without named columns.
    pub columns: Vec<String>,
}

/// Table schema as recorded in metadata.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub uri: String,
    pub name: String,
    pub key_format: String,
    pub value_format: String,
    pub key_columns: Vec<String>,
    pub value_columns: Vec<String>,
    /// Named column groups; empty means one default group.
    pub colgroup_names: Vec<String>,
    /// Column groups that exist in metadata.
    pub colgroups: Vec<ColgroupSchema>,
    /// Every configured column group exists.
    pub cg_complete: bool,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    pub fn load(conn: &ConnectionInner, uri: &str) -> Result<Self> {
        let name = uri
            .strip_prefix("table:")
            .ok_or_else(|| Error::invalid(format!("{}: expected a table: URI", uri)))?;
        let cfg = ConfigString::parse(&conn.metadata.search(uri)?)?;
        let key_format = cfg.get_str("key_format").unwrap_or_else(|| "u".to_string());
        let value_format = cfg.get_str("value_format").unwrap_or_else(|| "u".to_string());

        let columns = list_keys(&cfg, "columns");
        let nkey = if columns.is_empty() { 0 } else { column_count(&key_format)? };
        let (key_columns, value_columns) = if columns.len() >= nkey {
            let (k, v) = columns.split_at(nkey);
            (k.to_vec(), v.to_vec())
        } else {
            return Err(Error::invalid(format!("{}: fewer columns than key fields", uri)));
        };

        let colgroup_names = list_keys(&cfg, "colgroups");
        let cg_uris: Vec<String> = if colgroup_names.is_empty() {
            vec![format!("colgroup:{}", name)]
        } else {
            colgroup_names.iter().map(|cg| format!("colgroup:{}:{}", name, cg)).collect()
        };

        let mut colgroups = Vec::new();
        for cg_uri in &cg_uris {
            let Ok(cg_cfg) = conn.metadata.search(cg_uri) else {
                continue;
            };
            let cg_cfg = ConfigString::parse(&cg_cfg)?;
            let source = cg_cfg
                .get_nonempty("source")
                .ok_or_else(|| Error::invalid(format!("{}: column group has no source", cg_uri)))?;
            let mut cols = list_keys(&cg_cfg, "columns");
            if cols.is_empty() {
                cols = value_columns.clone();
            }
            colgroups.push(ColgroupSchema {
                uri: cg_uri.clone(),
                source,
                columns: cols,
            });
        }
        let cg_complete = colgroups.len() == cg_uris.len();

        let mut indexes = Vec::new();
        for (idx_uri, idx_cfg) in conn.metadata.scan_prefix(&format!("index:{}:", name)) {
            indexes.push(IndexSchema::from_config(&idx_uri, &ConfigString::parse(&idx_cfg)?, &key_columns)?);
        }

        Ok(Self {
            uri: uri.to_string(),
            name: name.to_string(),
            key_format,
            value_format,
            key_columns,
            value_columns,
            colgroup_names,
            colgroups,
            cg_complete,
            indexes,
        })
    }

    /// A table without named columns.
    pub fn is_simple(&self) -> bool {
        self.key_columns.is_empty() && self.value_columns.is_empty()
    }

    /// Format of one named column.
    pub fn column_format(&self, column: &str) -> Result<String> {
        if let Some(i) = self.key_columns.iter().position(|c| c == column) {
            return Ok(column_fields(&self.key_format)?[i].clone());
        }
        if let Some(i) = self.value_columns.iter().position(|c| c == column) {
            return Ok(column_fields(&self.value_format)?[i].clone());
        }
        Err(Error::invalid(format!("{}: column '{}' not found", self.uri, column)))
    }

    /// Value format of a column group holding `columns`.
    pub fn value_format_of(&self, columns: &[String]) -> Result<String> {
        let mut fmt = String::new();
        for column in columns {
            if !self.value_columns.contains(column) {
                return Err(Error::invalid(format!(
                    "{}: column '{}' is not a value column",
                    self.uri, column
                )));
            }
            fmt.push_str(&self.column_format(column)?);
        }
        Ok(fmt)
    }

    /// Values of `columns` taken from a full row.
    pub fn project(&self, key: &[String], values: &[String], columns: &[String]) -> Result<Vec<String>> {
        columns
            .iter()
            .map(|c| self.column_value(key, values, c))
            .collect()
    }

    pub fn column_value(&self, key: &[String], values: &[String], column: &str) -> Result<String> {
        if let Some(i) = self.key_columns.iter().position(|c| c == column) {
            return key.get(i).cloned().ok_or_else(|| Error::invalid("short key"));
        }
        if let Some(i) = self.value_columns.iter().position(|c| c == column) {
            return values.get(i).cloned().ok_or_else(|| Error::invalid("short value"));
        }
        Err(Error::invalid(format!("{}: column '{}' not found", self.uri, column)))
    }

    /// Live rows reassembled from the column groups, in key order.
    pub fn rows(&self, conn: &ConnectionInner) -> Vec<(Vec<String>, Vec<String>)> {
        let Some(first) = self.colgroups.first() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for row in conn.records.live_rows(&first.source) {
            if let Some(values) = self.row_values(conn, &row.key) {
                out.push((row.key, values));
            }
        }
        out
    }

    /// Full value of one row, or `None` when it is missing from any group.
    pub fn row_values(&self, conn: &ConnectionInner, key: &[String]) -> Option<Vec<String>> {
        if self.is_simple() {
            let cg = self.colgroups.first()?;
            let row = conn.records.get(&cg.source, key)?;
            return row.stop_ts.is_none().then_some(row.values);
        }
        let mut values = vec![String::new(); self.value_columns.len()];
        for cg in &self.colgroups {
            let row = conn.records.get(&cg.source, key)?;
            if row.stop_ts.is_some() {
                return None;
            }
            for (column, value) in cg.columns.iter().zip(row.values) {
                if let Some(i) = self.value_columns.iter().position(|c| c == column) {
                    values[i] = value;
                }
            }
        }
        Some(values)
    }
}

/// Load a table's schema.
pub fn load_table(conn: &ConnectionInner, uri: &str) -> Result<TableSchema> {
    TableSchema::load(conn, uri)
}

pub(super) struct TableCreator;

impl ObjectCreator for TableCreator {
    fn create(&self, session: &mut Session, uri: &str, exclusive: bool, config: &str) -> Result<()> {
        let conn = session.conn_arc();
        let import = session.import.active;
        let tablename = uri
            .strip_prefix("table:")
            .ok_or_else(|| Error::invalid(format!("{}: expected a table: URI", uri)))?;

        if conn.metadata.exists(uri) {
            if exclusive || import {
                return Err(Error::exists(uri));
            }
            return Ok(());
        }

        let user = ConfigString::parse(config)?;
        let mut stack: Vec<String> = vec![TABLE_META_DEFAULTS.to_string(), config.to_string()];
        let mut repair_filecfg: Option<String> = None;
        if import {
            let repair = user.get_bool("import.repair").unwrap_or(false);
            if let Some(list) = &session.import.list {
                stack[1] = list.find(uri)?.to_string();
            } else if !repair {
                // Only the import setting itself was given.
                if user.len() == 1 {
                    return Err(Error::invalid(format!(
                        "{}: import requires that the table configuration is specified or the 'repair' option is \
                         provided",
                        uri
                    )));
                }
            } else {
                let filename = format!("{}.wt", tablename);
                let desc = conn.blocks.read(&filename)?;
                let filecfg = merge_stack(&[FILE_META_DEFAULTS, &desc.repair_config()])?.to_string();
                stack.push(filecfg.clone());
                repair_filecfg = Some(filecfg);
            }
        }

        let refs: Vec<&str> = stack.iter().map(String::as_str).collect();
        let merged = merge_stack(&refs)?;
        let tablecfg = retain_keys(&merged, TABLE_KEYS);
        validate_table(uri, &tablecfg)?;
        let ncolgroups = list_keys(&tablecfg, "colgroups").len();
        let tablecfg = tablecfg.to_string();

        conn.metadata.insert(uri, &tablecfg)?;
        session.track.insert(uri);

        if ncolgroups == 0 {
            let cgname = format!("colgroup:{}", tablename);
            match repair_filecfg {
                Some(filecfg) => {
                    let importcfg = format!("{},import=(enabled,file_metadata=({}))", tablecfg, filecfg);
                    let cgcfg = merge_stack(&[&refs[1..].join(","), &importcfg])?.to_string();
                    create_colgroup(session, &cgname, exclusive, &cgcfg)?;
                }
                None => create_colgroup(session, &cgname, exclusive, config)?,
            }
        }

        let guard = conn.dhandles.try_exclusive(uri, session.id())?;
        session.track.handle_lock(guard);
        debug!("created {} colgroups={}", uri, ncolgroups);
        Ok(())
    }
}

/// Formats must parse, and named columns must cover every key and value field.
fn validate_table(uri: &str, cfg: &ConfigString) -> Result<()> {
    let key_format = cfg.get_str("key_format").unwrap_or_default();
    let value_format = cfg.get_str("value_format").unwrap_or_default();
    check_format(&key_format)?;
    check_format(&value_format)?;

    let columns = list_keys(cfg, "columns");
    if !columns.is_empty() {
        let expected = column_count(&key_format)? + column_count(&value_format)?;
        if columns.len() != expected {
            return Err(Error::invalid(format!(
                "{}: {} columns configured for {} key and value fields",
                uri,
                columns.len(),
                expected
            )));
        }
    }
    Ok(())
}
