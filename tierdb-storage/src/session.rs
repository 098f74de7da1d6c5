//! Sessions: the handle applications create objects, write rows and drive
//! tiered storage through. A session is single-threaded; open one per thread.

use std::sync::Arc;

use tracing::{debug, info};

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};
use tierdb_core::types::Timestamp;
use tierdb_core::utils::now_secs;

use crate::block::checkpoint_config;
use crate::connection::ConnectionInner;
use crate::dhandle::{ExclusiveGuard, OwnerId};
use crate::meta_track::MetaTrack;
use crate::schema::{load_table, schema_create, ImportContext, TableSchema};
use crate::tiered::switch;
use crate::tiered::FlushTierOptions;

pub struct Session {
    conn: Arc<ConnectionInner>,
    id: OwnerId,
    pub(crate) track: MetaTrack,
    pub(crate) import: ImportContext,
}

impl Session {
    pub(crate) fn internal(conn: Arc<ConnectionInner>) -> Self {
        let id = conn.next_session_id();
        Self {
            conn,
            id,
            track: MetaTrack::new(),
            import: ImportContext::default(),
        }
    }

    pub(crate) fn conn(&self) -> &ConnectionInner {
        &self.conn
    }

    pub(crate) fn conn_arc(&self) -> Arc<ConnectionInner> {
        Arc::clone(&self.conn)
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    /// Create a schema object, or import one with `import=(enabled=true,...)`.
    /// Either every metadata entry and file the call creates exists afterwards,
    /// or none does.
    pub fn create(&mut self, uri: &str, config: &str) -> Result<()> {
        let conn = self.conn_arc();
        conn.check_panic()?;
        if conn.config.readonly {
            return Err(Error::not_supported(format!("{}: create on a read-only connection", uri)));
        }
        let import = ConfigString::parse(config)?.get_bool("import.enabled").unwrap_or(false);

        let result = {
            let _schema = conn.schema_lock.lock();
            schema_create(self, uri, config)
        };
        match &result {
            Ok(()) if import => {
                conn.stats.record_import();
                info!("imported {}", uri);
            }
            Ok(()) => {
                conn.stats.record_create();
                debug!("created {}", uri);
            }
            Err(e) => debug!("create {} failed: {}", uri, e),
        }
        result
    }

    fn table(&self, uri: &str) -> Result<TableSchema> {
        let table = load_table(&self.conn, uri)?;
        if !table.cg_complete {
            return Err(Error::invalid(format!("{}: table has missing column groups", uri)));
        }
        Ok(table)
    }

    /// Write one row of a table at commit timestamp `ts`, updating its column
    /// groups and indexes.
    pub fn insert(&mut self, uri: &str, key: Vec<String>, values: Vec<String>, ts: Timestamp) -> Result<()> {
        self.conn.check_panic()?;
        let table = self.table(uri)?;
        if values.len() != table.value_columns.len() && !table.is_simple() {
            return Err(Error::invalid(format!(
                "{}: expected {} values, got {}",
                uri,
                table.value_columns.len(),
                values.len()
            )));
        }

        // Replacing a row moves its index entries.
        if let Some(old) = table.row_values(&self.conn, &key) {
            self.remove_index_entries(&table, &key, &old, ts)?;
        }
        for cg in &table.colgroups {
            let cg_values = if table.is_simple() {
                values.clone()
            } else {
                table.project(&key, &values, &cg.columns)?
            };
            self.write_source(&cg.source, key.clone(), cg_values, ts)?;
        }
        for index in table.indexes.iter().filter(|i| !i.extractor) {
            let index_key = index.key_of(&table, &key, &values)?;
            self.write_source(&index.source, index_key, Vec::new(), ts)?;
        }
        Ok(())
    }

    /// Remove one row of a table at commit timestamp `ts`.
    pub fn remove(&mut self, uri: &str, key: &[String], ts: Timestamp) -> Result<()> {
        self.conn.check_panic()?;
        let table = self.table(uri)?;
        let values = table
            .row_values(&self.conn, key)
            .ok_or_else(|| Error::not_found(format!("{}: key {:?}", uri, key)))?;
        self.remove_index_entries(&table, key, &values, ts)?;
        for cg in &table.colgroups {
            self.conn.records.remove(&cg.source, key, ts)?;
            self.mark_modified(&cg.source);
        }
        Ok(())
    }

    fn remove_index_entries(&mut self, table: &TableSchema, key: &[String], values: &[String], ts: Timestamp) -> Result<()> {
        for index in table.indexes.iter().filter(|i| !i.extractor) {
            let index_key = index.key_of(table, key, values)?;
            match self.conn.records.remove(&index.source, &index_key, ts) {
                Err(e) if e.is_not_found() => {}
                other => other?,
            }
            self.mark_modified(&index.source);
        }
        Ok(())
    }

    fn write_source(&mut self, source: &str, key: Vec<String>, values: Vec<String>, ts: Timestamp) -> Result<()> {
        if source.starts_with("tiered:") {
            let conn = self.conn_arc();
            let _schema = conn.schema_lock.lock();
            switch::ensure_current(self, source)?;
        }
        self.conn.records.insert(source, key, values, ts);
        self.mark_modified(source);
        Ok(())
    }

    fn mark_modified(&self, source: &str) {
        if !source.starts_with("tiered:") {
            return;
        }
        if let Some(tiered) = &self.conn.tiered {
            tiered.mark_modified(source);
        }
    }

    /// Current value of a row.
    pub fn get(&self, uri: &str, key: &[String]) -> Result<Option<Vec<String>>> {
        let table = self.table(uri)?;
        Ok(table.row_values(&self.conn, key))
    }

    /// Every live row of a table in key order.
    pub fn scan(&self, uri: &str) -> Result<Vec<(Vec<String>, Vec<String>)>> {
        Ok(self.table(uri)?.rows(&self.conn))
    }

    /// Live keys of an index in index order.
    pub fn index_scan(&self, uri: &str) -> Result<Vec<Vec<String>>> {
        let config = ConfigString::parse(&self.conn.metadata.search(uri)?)?;
        let source = config
            .get_nonempty("source")
            .ok_or_else(|| Error::invalid(format!("{}: index has no source", uri)))?;
        Ok(self.conn.records.live_rows(&source).into_iter().map(|r| r.key).collect())
    }

    /// Write every local data file's rows and record the new checkpoint in
    /// its metadata.
    pub fn checkpoint(&mut self) -> Result<()> {
        let conn = self.conn_arc();
        conn.check_panic()?;
        let _ckpt = conn.checkpoint_lock.lock();
        let _schema = conn.schema_lock.lock();

        let mut written = 0usize;
        for (uri, config) in conn.metadata.scan_prefix("file:") {
            let mut cfg = ConfigString::parse(&config)?;
            if cfg.get_bool("tiered_object").unwrap_or(false) {
                continue;
            }
            let name = uri.trim_start_matches("file:");
            if !conn.fs().exists(name)? {
                continue;
            }
            let ckpt = conn.blocks.checkpoint(name, conn.records.rows(&uri), now_secs())?;
            cfg.remove("checkpoint");
            cfg.set("checkpoint", checkpoint_config(std::slice::from_ref(&ckpt)));
            conn.metadata.update(&uri, &cfg.to_string())?;
            written += 1;
        }
        debug!("checkpoint wrote {} data files", written);
        Ok(())
    }

    /// Switch every modified tiered tree to a new local generation and queue
    /// the sealed generations for the object store. Accepts `force`,
    /// `sync=(on|off)` and `lock_wait`.
    pub fn flush_tier(&mut self, config: &str) -> Result<()> {
        let opts = FlushTierOptions::from_config(config)?;
        let conn = self.conn_arc();
        conn.check_panic()?;
        let tiered = conn
            .tiered
            .as_ref()
            .ok_or_else(|| Error::invalid("flush_tier requires tiered storage to be configured"))?;
        tiered.flush_tier(self, opts)
    }

    /// Switch one tiered tree, queueing its current generation for flushing.
    pub fn switch_tier(&mut self, uri: &str, force: bool) -> Result<()> {
        let conn = self.conn_arc();
        conn.check_panic()?;
        if conn.tiered.is_none() {
            return Err(Error::invalid("tiered storage is not configured"));
        }
        let _schema = conn.schema_lock.lock();
        switch::switch(self, uri, force)
    }

    /// Hold a data handle exclusively until the guard is dropped.
    pub fn lock_exclusive(&self, uri: &str) -> Result<ExclusiveGuard> {
        self.conn.dhandles.try_exclusive(uri, self.id)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tracking", &self.track.depth())
            .finish()
    }
}
