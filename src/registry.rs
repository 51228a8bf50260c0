//! Cookie -> pending request map for one generation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::request::PendingRequest;

#[derive(Debug, Default)]
pub struct Registry {
    pending: Mutex<HashMap<String, Arc<PendingRequest>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `rq` under its cookie. A duplicate cookie replaces the older entry.
    pub fn register(&self, rq: Arc<PendingRequest>) {
        let cookie = rq.cookie().to_string();
        if self.pending.lock().insert(cookie.clone(), rq).is_some() {
            warn!(cookie = %cookie, "duplicate request cookie registered");
        }
    }

    pub fn pop(&self, cookie: &str) -> Option<Arc<PendingRequest>> {
        self.pending.lock().remove(cookie)
    }

    /// Empty the registry, returning everything that was pending.
    pub fn drain_all(&self) -> Vec<Arc<PendingRequest>> {
        let drained = std::mem::take(&mut *self.pending.lock());
        drained.into_values().collect()
    }

    pub fn contains(&self, cookie: &str) -> bool {
        self.pending.lock().contains_key(cookie)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
