//! # TierDB Core
//!
//! This crate provides the fundamental building blocks for TierDB:
//! - Error types and status codes
//! - Configuration strings and typed connection configuration
//! - Statistics counters
//! - Common types and utilities
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   tierdb-core                   │
//! ├─────────────────────────────────────────────────┤
//! │  • error         - Error taxonomy & statuses   │
//! │  • config_string - key=value(...) parsing      │
//! │  • config        - Connection configuration    │
//! │  • metrics       - Statistics counters         │
//! │  • types         - URIs, ids, timestamps       │
//! │  • checksum      - CRC32 helpers               │
//! │  • utils         - Backoff, clocks             │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod checksum;
pub mod config;
pub mod config_string;
pub mod error;
pub mod metrics;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::ConnectionConfig;
pub use config_string::{ConfigString, ConfigValue};
pub use error::{Error, Result, ResultExt};
pub use metrics::{Stats, StatsSnapshot};
pub use types::{FileId, ObjectKind, Timestamp, TS_MAX, TS_NONE};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
