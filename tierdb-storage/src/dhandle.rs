//! Data handles: in-memory descriptors of open schema objects.
//!
//! A handle is held exclusively by at most one owner. The holder may
//! re-acquire it (nested schema operations do); everyone else gets `Busy`
//! instead of blocking, and the tiered flush path backs off and retries.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use tierdb_core::error::{Error, Result};

/// Identifies the session (or background thread) holding a handle.
pub type OwnerId = u64;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<OwnerId>,
    exclusive: u32,
}

#[derive(Debug)]
pub struct DataHandle {
    uri: String,
    state: Mutex<LockState>,
}

impl DataHandle {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_exclusive(&self) -> bool {
        self.state.lock().exclusive > 0
    }
}

/// Registry of data handles keyed by URI.
#[derive(Default)]
pub struct DataHandleRegistry {
    handles: DashMap<String, Arc<DataHandle>>,
}

impl DataHandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, uri: &str) -> Arc<DataHandle> {
        self.handles
            .entry(uri.to_string())
            .or_insert_with(|| {
                Arc::new(DataHandle {
                    uri: uri.to_string(),
                    state: Mutex::new(LockState::default()),
                })
            })
            .clone()
    }

    /// Acquire a handle exclusively on behalf of `owner`.
    pub fn try_exclusive(&self, uri: &str, owner: OwnerId) -> Result<ExclusiveGuard> {
        let handle = self.handle(uri);
        {
            let mut state = handle.state.lock();
            let reentrant = state.exclusive > 0 && state.owner == Some(owner);
            if !reentrant && state.exclusive > 0 {
                return Err(Error::busy(format!("{}: data handle in use", uri)));
            }
            state.owner = Some(owner);
            state.exclusive += 1;
        }
        trace!("dhandle exclusive: {} owner={}", uri, owner);
        Ok(ExclusiveGuard { handle })
    }

    pub fn is_exclusive(&self, uri: &str) -> bool {
        self.handles.get(uri).map(|h| h.is_exclusive()).unwrap_or(false)
    }

    /// Forget a handle nobody holds.
    pub fn discard(&self, uri: &str) {
        self.handles.remove_if(uri, |_, h| Arc::strong_count(h) == 1);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Releases one level of exclusive access when dropped.
#[derive(Debug)]
pub struct ExclusiveGuard {
    handle: Arc<DataHandle>,
}

impl ExclusiveGuard {
    pub fn uri(&self) -> &str {
        &self.handle.uri
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        let mut state = self.handle.state.lock();
        state.exclusive = state.exclusive.saturating_sub(1);
        if state.exclusive == 0 {
            state.owner = None;
            trace!("dhandle released: {}", self.handle.uri);
        }
    }
}
