//! # TierDB Storage Engine
//!
//! Schema objects over a metadata store, a connection-wide file handle cache,
//! and tiered storage that moves sealed generations of a tree to shared
//! object storage.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Create Path                           │
//! │                                                             │
//! │  Session::create ──> schema creators ──> metadata + files   │
//! │                          │                                  │
//! │                          ▼                                  │
//! │                   MetaTrack (undo on failure)               │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Tiered Path                           │
//! │                                                             │
//! │  flush_tier ──> switch generation ──> work queue            │
//! │                                          │                  │
//! │                                          ▼                  │
//! │                  storage server ──> object store            │
//! │                                          │                  │
//! │                                          ▼                  │
//! │                              local removal after retention  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod block;
pub mod connection;
pub mod dhandle;
pub mod fhandle;
pub mod format;
pub mod meta_track;
pub mod metadata;
pub mod os;
pub mod records;
pub mod schema;
pub mod session;
pub mod tiered;

pub use block::{BlockManager, CheckpointDescriptor};
pub use connection::{Connection, GlobalTimestamps};
pub use fhandle::{FileHandle, FileHandleCache};
pub use metadata::MetadataStore;
pub use os::{FileSystem, LocalFileSystem};
pub use records::StoredRow;
pub use schema::{DataSource, ImportList, IndexSchema, TableSchema};
pub use session::Session;
pub use tiered::{BucketStorage, FlushTierOptions, StorageSource, WorkUnit};
