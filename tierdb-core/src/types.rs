//! # Core Types
//!
//! Identifiers, timestamps and the URI namespaces of schema objects.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Commit / durable timestamp.
pub type Timestamp = u64;

/// No timestamp.
pub const TS_NONE: Timestamp = 0;
/// Largest possible timestamp.
pub const TS_MAX: Timestamp = u64::MAX;

/// History store object; stray copies on disk are removed before it is created.
pub const HS_URI: &str = "file:WiredTigerHS.wt";

/// Suffix of local and remote tiered object files.
pub const TIERED_OBJECT_SUFFIX: &str = ".wtobj";

/// File id as recorded in metadata (`id=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl FileId {
    /// Sentinel for entries that carry no id.
    pub const INVALID: FileId = FileId(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-disk btree format version written into file metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeVersion {
    pub major: u16,
    pub minor: u16,
}

impl BtreeVersion {
    pub const CURRENT: BtreeVersion = BtreeVersion { major: 1, minor: 1 };

    /// `version=(major=..,minor=..)` config fragment.
    pub fn config(&self) -> String {
        format!("version=(major={},minor={})", self.major, self.minor)
    }
}

/// URI namespace of a schema object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Colgroup,
    File,
    Lsm,
    Index,
    Object,
    Table,
    Tier,
    Tiered,
    /// Prefix owned by an application-registered data source.
    Custom(String),
}

impl ObjectKind {
    /// Classify a URI by its prefix.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (prefix, _) = split_uri(uri)?;
        Ok(match prefix {
            "colgroup" => ObjectKind::Colgroup,
            "file" => ObjectKind::File,
            "lsm" => ObjectKind::Lsm,
            "index" => ObjectKind::Index,
            "object" => ObjectKind::Object,
            "table" => ObjectKind::Table,
            "tier" => ObjectKind::Tier,
            "tiered" => ObjectKind::Tiered,
            other => ObjectKind::Custom(other.to_string()),
        })
    }

    pub fn prefix(&self) -> &str {
        match self {
            ObjectKind::Colgroup => "colgroup",
            ObjectKind::File => "file",
            ObjectKind::Lsm => "lsm",
            ObjectKind::Index => "index",
            ObjectKind::Object => "object",
            ObjectKind::Table => "table",
            ObjectKind::Tier => "tier",
            ObjectKind::Tiered => "tiered",
            ObjectKind::Custom(p) => p,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Split `prefix:suffix`; both parts must be present.
pub fn split_uri(uri: &str) -> Result<(&str, &str)> {
    match uri.split_once(':') {
        Some((prefix, suffix)) if !prefix.is_empty() && !suffix.is_empty() => Ok((prefix, suffix)),
        _ => Err(Error::invalid(format!("malformed URI: {}", uri))),
    }
}

/// Everything after the first `:`, or the whole string.
pub fn uri_suffix(uri: &str) -> &str {
    uri.split_once(':').map(|(_, s)| s).unwrap_or(uri)
}

/// Local file URI of a tiered generation.
pub fn tiered_file_uri(name: &str, id: u32) -> String {
    format!("file:{}-{:010}{}", name, id, TIERED_OBJECT_SUFFIX)
}

/// Remote object URI of a tiered generation.
pub fn tiered_object_uri(name: &str, id: u32) -> String {
    format!("object:{}-{:010}{}", name, id, TIERED_OBJECT_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_uri() {
        assert_eq!(ObjectKind::from_uri("file:t1.wt").unwrap(), ObjectKind::File);
        assert_eq!(ObjectKind::from_uri("tiered:t").unwrap(), ObjectKind::Tiered);
        assert_eq!(
            ObjectKind::from_uri("memstore:x").unwrap(),
            ObjectKind::Custom("memstore".into())
        );
        assert!(ObjectKind::from_uri("nocolon").is_err());
        assert!(ObjectKind::from_uri("file:").is_err());
    }

    #[test]
    fn test_tiered_names() {
        assert_eq!(tiered_file_uri("t", 3), "file:t-0000000003.wtobj");
        assert_eq!(tiered_object_uri("t", 12), "object:t-0000000012.wtobj");
    }
}
