//! Path-keyed memo of exec decisions.
//!
//! Guarded by its own lock. The engine never holds this lock together with
//! the [`PolicyStore`](super::PolicyStore) lock, so there is no ordering to
//! get wrong.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::Verdict;

/// Memoized verdicts keyed by executable path.
#[derive(Debug, Default)]
pub struct DecisionCache {
    entries: Mutex<HashMap<String, Verdict>>,
}

impl DecisionCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached verdict for `path`.
    pub fn get(&self, path: &str) -> Option<Verdict> {
        self.entries.lock().get(path).copied()
    }

    /// Store a verdict. Last writer wins.
    pub fn insert(&self, path: &str, verdict: Verdict) {
        self.entries.lock().insert(path.to_owned(), verdict);
    }

    /// Drop the entry for `path` and every entry beneath it when `path` is a
    /// directory. Returns the number of entries removed.
    pub fn invalidate(&self, path: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|known, _| !is_same_or_descendant(known, path));
        before.saturating_sub(entries.len())
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached verdicts.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// `candidate` equals `root` or lies beneath it on a `/` boundary.
pub(crate) fn is_same_or_descendant(candidate: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return false;
    }
    match candidate.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
