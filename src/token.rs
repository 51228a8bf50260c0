//! Correlation identifiers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counter producing `name#n` tokens.
///
/// With a `width`, the counter is zero-padded (`agent#007`).
#[derive(Debug)]
pub struct TokenCounter {
    name: String,
    width: usize,
    n: AtomicU64,
}

impl TokenCounter {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_format(name, 0, 0)
    }

    /// Counter whose first `next()` returns `start + 1`.
    pub fn with_format(name: impl Into<String>, width: usize, start: u64) -> Self {
        Self {
            name: name.into(),
            width,
            n: AtomicU64::new(start),
        }
    }

    pub fn next(&self) -> (u64, String) {
        let n = self.n.fetch_add(1, Ordering::Relaxed) + 1;
        let s = format!("{}#{:0width$}", self.name, n, width = self.width);
        (n, s)
    }
}
