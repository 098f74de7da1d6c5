//! Import list: the entries of an exported metadata file that belong to the
//! object being imported.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};
use tierdb_core::types::{uri_suffix, FileId};

use crate::metadata::read_export;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub uri: String,
    pub config: String,
    pub file_id: FileId,
}

/// Entries sorted by URI for lookups during recursive creation.
#[derive(Debug, Default)]
pub struct ImportList {
    entries: Vec<ImportEntry>,
}

impl ImportList {
    /// Read an export file and keep the entries whose URI suffix starts with
    /// the suffix of `uri`. This also catches unrelated objects sharing the
    /// prefix (`t` and `t123`); lookups are by exact URI so they are harmless.
    ///
    /// File ids are remapped into the destination id space before the list is
    /// returned. A missing export file gives an empty list.
    pub fn parse(export_file: &Path, uri: &str, next_file_id: &AtomicU32) -> Result<Self> {
        let target = uri_suffix(uri);
        let Some(exported) = read_export(export_file)? else {
            debug!("import metadata file {} does not exist", export_file.display());
            return Ok(Self::default());
        };

        let mut entries = Vec::new();
        for (key, config) in exported {
            let suffix = match key.split_once(':') {
                Some((_, s)) if !s.is_empty() => s,
                _ => {
                    return Err(Error::Corruption {
                        details: format!("{}: malformed metadata key {}", export_file.display(), key),
                    })
                }
            };
            if !suffix.starts_with(target) {
                continue;
            }
            let file_id = ConfigString::parse(&config)?
                .get_int("id")
                .and_then(|id| u32::try_from(id).ok())
                .map(FileId)
                .unwrap_or(FileId::INVALID);
            entries.push(ImportEntry {
                uri: key,
                config,
                file_id,
            });
        }

        let mut list = Self { entries };
        list.fix_file_ids(next_file_id)?;
        list.entries.sort_by(|a, b| a.uri.cmp(&b.uri));
        debug!("import list for {}: {} entries", uri, list.entries.len());
        Ok(list)
    }

    /// Give every distinct source file id a fresh id. Entries that shared an id
    /// in the source database share the new one.
    fn fix_file_ids(&mut self, next_file_id: &AtomicU32) -> Result<()> {
        self.entries.sort_by_key(|e| e.file_id);
        let mut prev = FileId::INVALID;
        let mut new_id = FileId::INVALID;
        for entry in self.entries.iter_mut() {
            if !entry.file_id.is_valid() {
                continue;
            }
            if entry.file_id != prev {
                prev = entry.file_id;
                new_id = FileId(next_file_id.fetch_add(1, Ordering::SeqCst) + 1);
            }
            let id_cfg = format!("id={}", new_id);
            entry.config = ConfigString::collapse(&[entry.config.as_str(), id_cfg.as_str()])?;
            entry.file_id = new_id;
        }
        Ok(())
    }

    /// Exported configuration of `uri`.
    pub fn find(&self, uri: &str) -> Result<&str> {
        self.entries
            .binary_search_by(|e| e.uri.as_str().cmp(uri))
            .map(|i| self.entries[i].config.as_str())
            .map_err(|_| Error::not_found(format!("failed to find metadata for {}", uri)))
    }

    pub fn entries(&self) -> &[ImportEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::write_export;
    use std::fs::File;
    use tempfile::TempDir;

    fn export(dir: &TempDir, entries: &[(&str, &str)]) -> std::path::PathBuf {
        let path = dir.path().join("WiredTiger.export");
        let owned: Vec<(String, String)> = entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        write_export(&owned, File::create(&path).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_filter_and_remap() {
        let dir = TempDir::new().unwrap();
        let path = export(
            &dir,
            &[
                ("table:t", "colgroups=()"),
                ("colgroup:t", "source=\"file:t.wt\""),
                ("file:t.wt", "id=12,key_format=S"),
                ("file:t_idx.wti", "id=12,key_format=S"),
                ("file:t2.wt", "id=30"),
                ("file:other.wt", "id=13"),
            ],
        );
        let next = AtomicU32::new(100);
        let list = ImportList::parse(&path, "table:t", &next).unwrap();

        // `other` is filtered out; `t2` shares the prefix and is kept.
        assert_eq!(list.len(), 5);
        assert!(list.find("file:other.wt").unwrap_err().is_not_found());

        let id = |uri: &str| ConfigString::parse(list.find(uri).unwrap()).unwrap().get_int("id");
        assert_eq!(id("file:t.wt"), Some(101));
        assert_eq!(id("file:t_idx.wti"), Some(101));
        assert_eq!(id("file:t2.wt"), Some(102));
        assert_eq!(id("table:t"), None);
        assert_eq!(next.load(Ordering::SeqCst), 102);

        let uris: Vec<_> = list.entries().iter().map(|e| e.uri.as_str()).collect();
        let mut sorted = uris.clone();
        sorted.sort();
        assert_eq!(uris, sorted);
    }

    #[test]
    fn test_missing_export_is_empty() {
        let dir = TempDir::new().unwrap();
        let next = AtomicU32::new(0);
        let list = ImportList::parse(&dir.path().join("nope"), "file:a.wt", &next).unwrap();
        assert!(list.is_empty());
        assert!(list.find("file:a.wt").unwrap_err().is_not_found());
    }
}
