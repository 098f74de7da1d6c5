//! # Metadata Store
//!
//! URI to configuration-string map backing every schema object. The whole map
//! is persisted after each change: serialized with MessagePack to a temporary
//! file which is then renamed over `tierdb.meta`.
//!
//! Export files use a plain text layout of alternating key and value lines and
//! are what `import.metadata_file` reads.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};

/// Name of the metadata file inside the database home.
pub const METADATA_FILE: &str = "tierdb.meta";
const METADATA_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataImage {
    version: u32,
    entries: BTreeMap<String, String>,
}

pub struct MetadataStore {
    path: Option<PathBuf>,
    readonly: bool,
    entries: RwLock<BTreeMap<String, String>>,
}

impl MetadataStore {
    /// Open the metadata of a database home, creating an empty store if none exists.
    pub fn open(home: &Path, readonly: bool) -> Result<Self> {
        let path = home.join(METADATA_FILE);
        let entries = if path.exists() {
            let bytes = fs::read(&path)?;
            let image: MetadataImage = rmp_serde::from_slice(&bytes).map_err(|e| Error::Corruption {
                details: format!("{}: {}", path.display(), e),
            })?;
            if image.version != METADATA_VERSION {
                return Err(Error::Corruption {
                    details: format!("{}: unsupported metadata version {}", path.display(), image.version),
                });
            }
            image.entries
        } else {
            BTreeMap::new()
        };
        info!("metadata opened: {} entries", entries.len());
        Ok(Self {
            path: Some(path),
            readonly,
            entries: RwLock::new(entries),
        })
    }

    /// Store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            readonly: false,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, uri: &str, config: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(uri) {
            return Err(Error::exists(uri));
        }
        entries.insert(uri.to_string(), config.to_string());
        self.persist(&entries)?;
        debug!("metadata insert: {}", uri);
        Ok(())
    }

    pub fn search(&self, uri: &str) -> Result<String> {
        self.entries
            .read()
            .get(uri)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("metadata entry {}", uri)))
    }

    pub fn exists(&self, uri: &str) -> bool {
        self.entries.read().contains_key(uri)
    }

    /// Insert or overwrite an entry, returning the previous value.
    pub fn update(&self, uri: &str, config: &str) -> Result<Option<String>> {
        let mut entries = self.entries.write();
        let previous = entries.insert(uri.to_string(), config.to_string());
        self.persist(&entries)?;
        debug!("metadata update: {}", uri);
        Ok(previous)
    }

    pub fn remove(&self, uri: &str) -> Result<String> {
        let mut entries = self.entries.write();
        let removed = entries
            .remove(uri)
            .ok_or_else(|| Error::not_found(format!("metadata entry {}", uri)))?;
        self.persist(&entries)?;
        debug!("metadata remove: {}", uri);
        Ok(removed)
    }

    /// Entries whose URI starts with `prefix`, in URI order.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn list(&self) -> Vec<(String, String)> {
        self.entries.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Largest `id=` recorded in any entry.
    pub fn max_file_id(&self) -> u32 {
        self.entries
            .read()
            .values()
            .filter_map(|cfg| ConfigString::parse(cfg).ok())
            .filter_map(|cfg| cfg.get_int("id"))
            .filter_map(|id| u32::try_from(id).ok())
            .max()
            .unwrap_or(0)
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if self.readonly {
            return Err(Error::not_supported("metadata is read-only"));
        }
        let image = MetadataImage {
            version: METADATA_VERSION,
            entries: entries.clone(),
        };
        let bytes = rmp_serde::to_vec(&image).map_err(|e| Error::Corruption {
            details: format!("failed to encode metadata: {}", e),
        })?;
        let tmp = path.with_extension("meta.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Write entries as alternating key and value lines.
pub fn write_export<W: Write>(entries: &[(String, String)], writer: W) -> Result<()> {
    let mut out = BufWriter::new(writer);
    for (key, value) in entries {
        if key.contains('\n') || value.contains('\n') {
            return Err(Error::invalid(format!("{}: metadata cannot be exported with embedded newlines", key)));
        }
        writeln!(out, "{}", key)?;
        writeln!(out, "{}", value)?;
    }
    out.flush()?;
    Ok(())
}

/// Read an export file. A missing file yields `None`.
pub fn read_export(path: &Path) -> Result<Option<Vec<(String, String)>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut lines = BufReader::new(file).lines();
    let mut entries = Vec::new();
    while let Some(key) = lines.next() {
        let key = key?;
        let value = lines.next().ok_or_else(|| Error::Corruption {
            details: format!("{}: key {} has no value line", path.display(), key),
        })??;
        entries.push((key, value));
    }
    Ok(Some(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_insert_search_remove() {
        let meta = MetadataStore::in_memory();
        meta.insert("file:a.wt", "id=1").unwrap();
        assert!(matches!(meta.insert("file:a.wt", "id=2"), Err(Error::AlreadyExists { .. })));
        assert_eq!(meta.search("file:a.wt").unwrap(), "id=1");
        assert_eq!(meta.update("file:a.wt", "id=3").unwrap().as_deref(), Some("id=1"));
        assert_eq!(meta.remove("file:a.wt").unwrap(), "id=3");
        assert!(meta.search("file:a.wt").unwrap_err().is_not_found());
        assert!(meta.remove("file:a.wt").unwrap_err().is_not_found());
    }

    #[test]
    fn test_scan_prefix_and_max_id() {
        let meta = MetadataStore::in_memory();
        meta.insert("file:a.wt", "id=4").unwrap();
        meta.insert("file:b.wt", "id=9").unwrap();
        meta.insert("table:a", "columns=()").unwrap();
        meta.insert("tiered:t", "id=7,tiers=()").unwrap();
        let files = meta.scan_prefix("file:");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0, "file:a.wt");
        assert_eq!(meta.max_file_id(), 9);
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let meta = MetadataStore::open(dir.path(), false).unwrap();
            meta.insert("table:t", "key_format=S").unwrap();
        }
        let meta = MetadataStore::open(dir.path(), false).unwrap();
        assert_eq!(meta.search("table:t").unwrap(), "key_format=S");
    }

    #[test]
    fn test_export_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.txt");
        let entries = vec![
            ("table:t".to_string(), "colgroups=()".to_string()),
            ("file:t.wt".to_string(), "id=3,checkpoint_lsn=".to_string()),
        ];
        write_export(&entries, File::create(&path).unwrap()).unwrap();
        assert_eq!(read_export(&path).unwrap().unwrap(), entries);
        assert!(read_export(&dir.path().join("missing")).unwrap().is_none());

        fs::write(&path, "table:t\n").unwrap();
        assert!(matches!(read_export(&path), Err(Error::Corruption { .. })));
    }
}
