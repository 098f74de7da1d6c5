//! # Common Utilities
//!
//! Utility functions and helpers used throughout TierDB.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Align value to boundary
pub fn align_to(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

/// Exponential backoff schedule: starts at `initial`, doubles, and stops once
/// the next delay would reach `limit`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub limit: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            limit: Duration::from_millis(3000),
        }
    }
}

/// Retry with exponential backoff
///
/// `f` is attempted once per step of the schedule. Only errors accepted by
/// `should_retry` are retried; the last error is returned when the schedule
/// runs out. `on_retry` is called before each sleep.
pub fn retry_with_backoff<T, F, R, N>(
    backoff: Backoff,
    mut f: F,
    should_retry: R,
    mut on_retry: N,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
    R: Fn(&crate::Error) -> bool,
    N: FnMut(Duration),
{
    let mut delay = backoff.initial;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if should_retry(&e) && delay < backoff.limit => {
                on_retry(delay);
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
