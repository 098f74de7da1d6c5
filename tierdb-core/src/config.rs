//! # Configuration Management
//!
//! Connection-level configuration for TierDB. Settings can be built in code
//! (every struct has a sensible `Default`) or parsed from a configuration
//! string such as `direct_io=true,buffer_alignment=4096,tiered_manager=(wait=50)`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config_string::ConfigString;
use crate::error::{Error, Result};

/// Upper bound on tiered storage worker threads.
pub const TIERED_MAX_WORKERS: u32 = 20;
/// Lower bound on tiered storage worker threads.
pub const TIERED_MIN_WORKERS: u32 = 1;

/// Main connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Buffer alignment for direct I/O, 0 when unaligned.
    pub buffer_alignment: u32,
    /// Direct I/O enabled for data files.
    pub direct_io: bool,
    pub readonly: bool,
    /// Tiered storage is enabled when a bucket is configured.
    pub tiered_storage: Option<TieredStorageConfig>,
    pub tiered_manager: TieredManagerConfig,
    /// How often the storage server wakes up without being signalled.
    pub tiered_server_interval: Duration,
    pub flush_wait: FlushWaitConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_alignment: 0,
            direct_io: false,
            readonly: false,
            tiered_storage: None,
            tiered_manager: TieredManagerConfig::default(),
            tiered_server_interval: Duration::from_secs(60),
            flush_wait: FlushWaitConfig::default(),
        }
    }
}

/// Shared object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredStorageConfig {
    /// Bucket location; a directory for the bundled bucket store.
    pub bucket: PathBuf,
    pub bucket_prefix: String,
    /// Seconds a flushed local copy is kept before it may be removed.
    pub local_retention: u64,
}

impl Default for TieredStorageConfig {
    fn default() -> Self {
        Self {
            bucket: PathBuf::from("./bucket"),
            bucket_prefix: String::new(),
            local_retention: 300,
        }
    }
}

/// Tiered manager thread configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredManagerConfig {
    /// Interval between manager passes; zero means no manager thread.
    pub wait: Duration,
    pub threads_min: u32,
    pub threads_max: u32,
}

impl Default for TieredManagerConfig {
    fn default() -> Self {
        Self {
            wait: Duration::ZERO,
            threads_min: TIERED_MIN_WORKERS,
            threads_max: 8,
        }
    }
}

impl TieredManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads_max > TIERED_MAX_WORKERS {
            return Err(Error::invalid(format!(
                "Maximum storage workers of {} larger than {}",
                self.threads_max, TIERED_MAX_WORKERS
            )));
        }
        if self.threads_min < TIERED_MIN_WORKERS {
            return Err(Error::invalid(format!(
                "Minimum storage workers of {} less than {}",
                self.threads_min, TIERED_MIN_WORKERS
            )));
        }
        if self.threads_min > self.threads_max {
            return Err(Error::invalid(format!(
                "Minimum storage workers of {} larger than maximum of {}",
                self.threads_min, self.threads_max
            )));
        }
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        !self.wait.is_zero()
    }
}

/// Two-phase wait used while draining queued flush work: a bounded number of
/// yields, then timed condition waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushWaitConfig {
    pub spin_iterations: u32,
    pub cond_wait: Duration,
}

impl Default for FlushWaitConfig {
    fn default() -> Self {
        Self {
            spin_iterations: 1000,
            cond_wait: Duration::from_millis(200),
        }
    }
}

impl ConnectionConfig {
    /// Parse a connection configuration string on top of the defaults.
    pub fn from_config_str(config: &str) -> Result<Self> {
        let cfg = ConfigString::parse(config)?;
        let mut out = ConnectionConfig::default();

        if let Some(v) = cfg.get_int("buffer_alignment") {
            out.buffer_alignment = u32::try_from(v)
                .map_err(|_| Error::invalid(format!("buffer_alignment out of range: {}", v)))?;
        }
        if let Some(v) = cfg.get("direct_io") {
            // Accept both `direct_io=true` and the list form `direct_io=(data,checkpoint)`.
            out.direct_io = match v.as_bool() {
                Some(b) => b,
                None => !v.is_empty(),
            };
        }
        if let Some(v) = cfg.get_bool("readonly") {
            out.readonly = v;
        }

        if let Some(bucket) = cfg.get_nonempty("tiered_storage.bucket") {
            let mut tiered = TieredStorageConfig {
                bucket: PathBuf::from(bucket),
                ..Default::default()
            };
            if let Some(prefix) = cfg.get_nonempty("tiered_storage.bucket_prefix") {
                tiered.bucket_prefix = prefix;
            }
            if let Some(secs) = cfg.get_int("tiered_storage.local_retention") {
                tiered.local_retention = non_negative("tiered_storage.local_retention", secs)?;
            }
            out.tiered_storage = Some(tiered);
        }

        if let Some(ms) = cfg.get_int("tiered_manager.wait") {
            out.tiered_manager.wait = Duration::from_millis(non_negative("tiered_manager.wait", ms)?);
        }
        if let Some(n) = cfg.get_int("tiered_manager.threads_min") {
            out.tiered_manager.threads_min = non_negative("tiered_manager.threads_min", n)? as u32;
        }
        if let Some(n) = cfg.get_int("tiered_manager.threads_max") {
            out.tiered_manager.threads_max = non_negative("tiered_manager.threads_max", n)? as u32;
        }
        if let Some(ms) = cfg.get_int("tiered_server.interval") {
            out.tiered_server_interval = Duration::from_millis(non_negative("tiered_server.interval", ms)?);
        }
        if let Some(n) = cfg.get_int("flush_wait.spin_iterations") {
            out.flush_wait.spin_iterations = non_negative("flush_wait.spin_iterations", n)? as u32;
        }
        if let Some(ms) = cfg.get_int("flush_wait.cond_wait") {
            out.flush_wait.cond_wait = Duration::from_millis(non_negative("flush_wait.cond_wait", ms)?);
        }

        out.tiered_manager.validate()?;
        Ok(out)
    }

    pub fn tiered_enabled(&self) -> bool {
        self.tiered_storage.is_some()
    }
}

fn non_negative(name: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::invalid(format!("{} must not be negative: {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ConnectionConfig::default();
        assert!(!cfg.tiered_enabled());
        assert!(!cfg.tiered_manager.enabled());
        assert_eq!(cfg.flush_wait.spin_iterations, 1000);
    }

    #[test]
    fn test_parse_tiered_settings() {
        let cfg = ConnectionConfig::from_config_str(
            "tiered_storage=(bucket=/tmp/b,bucket_prefix=pfx-,local_retention=10),tiered_manager=(wait=25,threads_min=1,threads_max=4)",
        )
        .unwrap();
        let tiered = cfg.tiered_storage.unwrap();
        assert_eq!(tiered.bucket, PathBuf::from("/tmp/b"));
        assert_eq!(tiered.bucket_prefix, "pfx-");
        assert_eq!(tiered.local_retention, 10);
        assert_eq!(cfg.tiered_manager.wait, Duration::from_millis(25));
        assert_eq!(cfg.tiered_manager.threads_max, 4);
    }

    #[test]
    fn test_worker_bounds() {
        assert!(ConnectionConfig::from_config_str("tiered_manager=(threads_max=21)").is_err());
        assert!(ConnectionConfig::from_config_str("tiered_manager=(threads_min=0)").is_err());
        assert!(ConnectionConfig::from_config_str("tiered_manager=(threads_min=5,threads_max=2)").is_err());
    }

    #[test]
    fn test_direct_io_list_form() {
        let cfg = ConnectionConfig::from_config_str("direct_io=(data),buffer_alignment=4096").unwrap();
        assert!(cfg.direct_io);
        assert_eq!(cfg.buffer_alignment, 4096);
    }
}
