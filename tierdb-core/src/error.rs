//! # Error Handling
//!
//! Error types for TierDB operations.
//!
//! Every public operation returns a [`Result`]. Errors map onto the small set
//! of status codes callers of the engine understand:
//!
//! | Variant | Status | Meaning |
//! |---------|--------|---------|
//! | `NotFound` | `WT_NOTFOUND` | key / metadata entry missing |
//! | `Rollback` | `WT_ROLLBACK` | refused to avoid future data loss |
//! | `InvalidArgument` | `EINVAL` | bad or conflicting configuration |
//! | `AlreadyExists` | `EEXIST` | object already exists |
//! | `NoEntry` | `ENOENT` | file or table missing |
//! | `NotSupported` | `ENOTSUP` | operation not supported for the object |
//! | `Busy` | `EBUSY` | handle or lock held elsewhere |

use thiserror::Error;

/// Result type alias for TierDB operations
pub type Result<T> = std::result::Result<T, Error>;

pub const WT_ROLLBACK: i32 = -31800;
pub const WT_NOTFOUND: i32 = -31803;
pub const WT_PANIC: i32 = -31804;

pub const EINVAL: i32 = 22;
pub const EEXIST: i32 = 17;
pub const ENOENT: i32 = 2;
pub const ENOTSUP: i32 = 95;
pub const EBUSY: i32 = 16;
pub const EIO: i32 = 5;

/// Primary error type for TierDB
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("conflict with concurrent or future state: {message}")]
    Rollback { message: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("already exists: {uri}")]
    AlreadyExists { uri: String },

    #[error("no such file or object: {message}")]
    NoEntry { message: String },

    #[error("not supported: {message}")]
    NotSupported { message: String },

    #[error("resource busy: {message}")]
    Busy { message: String },

    #[error("IO error: {message}")]
    Io { message: String, source: std::io::Error },

    #[error("storage source error: {message}")]
    Storage { message: String },

    #[error("corruption detected: {details}")]
    Corruption { details: String },

    #[error("connection panicked: {message}")]
    Panic { message: String },
}

impl Error {
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound { message: message.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument { message: message.into() }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Error::NotSupported { message: message.into() }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Error::Busy { message: message.into() }
    }

    pub fn no_entry(message: impl Into<String>) -> Self {
        Error::NoEntry { message: message.into() }
    }

    pub fn exists(uri: impl Into<String>) -> Self {
        Error::AlreadyExists { uri: uri.into() }
    }

    pub fn rollback(message: impl Into<String>) -> Self {
        Error::Rollback { message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy { .. })
    }

    /// Check if error is recoverable
    ///
    /// A recoverable error leaves no partial state behind; the caller may fix
    /// its input or simply try again.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Busy { .. } => true,
            Error::Storage { .. } => true,
            Error::Corruption { .. } => false,
            Error::Panic { .. } => false,
            Error::Io { .. } => false,
            _ => true,
        }
    }

    /// Numeric status, `0` being reserved for success.
    pub fn status(&self) -> i32 {
        match self {
            Error::NotFound { .. } => WT_NOTFOUND,
            Error::Rollback { .. } => WT_ROLLBACK,
            Error::InvalidArgument { .. } => EINVAL,
            Error::AlreadyExists { .. } => EEXIST,
            Error::NoEntry { .. } => ENOENT,
            Error::NotSupported { .. } => ENOTSUP,
            Error::Busy { .. } => EBUSY,
            Error::Io { source, .. } => source.raw_os_error().unwrap_or(EIO),
            Error::Storage { .. } => EIO,
            Error::Corruption { .. } => WT_PANIC,
            Error::Panic { .. } => WT_PANIC,
        }
    }

    /// Get error code for logging and monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "WT_NOTFOUND",
            Error::Rollback { .. } => "WT_ROLLBACK",
            Error::InvalidArgument { .. } => "EINVAL",
            Error::AlreadyExists { .. } => "EEXIST",
            Error::NoEntry { .. } => "ENOENT",
            Error::NotSupported { .. } => "ENOTSUP",
            Error::Busy { .. } => "EBUSY",
            Error::Io { .. } => "IO_ERROR",
            Error::Storage { .. } => "STORAGE_SOURCE_ERROR",
            Error::Corruption { .. } => "CORRUPTION",
            Error::Panic { .. } => "WT_PANIC",
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NoEntry { message: err.to_string() },
            _ => Error::Io {
                message: err.to_string(),
                source: err,
            },
        }
    }
}

/// Converts a result into its numeric status.
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}

/// Extension trait for adding context to results
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Treat `NotFound` as success, yielding `None`.
    fn not_found_ok(self) -> Result<Option<T>>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        // Keep the variant so the status code survives; only the text changes.
        self.map_err(|e| match e {
            Error::NotFound { message } => Error::NotFound { message: format!("{}: {}", f(), message) },
            Error::InvalidArgument { message } => {
                Error::InvalidArgument { message: format!("{}: {}", f(), message) }
            }
            Error::NoEntry { message } => Error::NoEntry { message: format!("{}: {}", f(), message) },
            Error::Storage { message } => Error::Storage { message: format!("{}: {}", f(), message) },
            other => other,
        })
    }

    fn not_found_ok(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
