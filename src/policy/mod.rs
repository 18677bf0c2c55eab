//! In-memory execution policy: blocked digests, temporary allow windows, and
//! short-lived caller grants for the protected configuration file.
//!
//! Every operation runs under one [`parking_lot::Mutex`] whose critical
//! sections are pure map lookups or mutations. No I/O or hashing happens
//! while it is held; callers build new collections before taking the lock.

pub mod cache;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::identity::Digest;
use crate::monitor::Pid;

/// Grants above this count trigger a prune of expired entries on insert.
const CALLER_PRUNE_THRESHOLD: usize = 10;

/// Allow or deny outcome of an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Let the operation proceed.
    Allow,
    /// Block the operation.
    Deny,
}

impl Verdict {
    /// Returns `true` for [`Verdict::Deny`].
    pub fn is_deny(self) -> bool {
        matches!(self, Self::Deny)
    }
}

/// One protected application pushed by the privileged application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedEntry {
    /// Bundle identifier of the protected application.
    pub identifier: String,
    /// Path of its main executable.
    pub path: String,
    /// Expected content digest of that executable.
    pub digest: Digest,
}

/// Counts reported after a policy replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySummary {
    /// Distinct blocked digests now in force.
    pub digests: usize,
    /// Path mappings contributed by the new entries.
    pub paths: usize,
}

/// Entries removed by an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Expired temporary allow windows.
    pub temporary_allows: usize,
    /// Expired caller grants.
    pub caller_grants: usize,
}

#[derive(Debug, Default)]
struct PolicyState {
    blocked: HashSet<Digest>,
    path_digests: HashMap<String, Digest>,
    temporary_allows: HashMap<Digest, DateTime<Utc>>,
    caller_grants: HashMap<Pid, DateTime<Utc>>,
}

impl PolicyState {
    /// Lazily drops an expired temporary allow.
    fn temporarily_allowed(&mut self, digest: &Digest, now: DateTime<Utc>) -> bool {
        match self.temporary_allows.get(digest) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                self.temporary_allows.remove(digest);
                false
            }
            None => false,
        }
    }

    fn classify(&mut self, digest: &Digest, now: DateTime<Utc>) -> Verdict {
        if self.temporarily_allowed(digest, now) {
            return Verdict::Allow;
        }
        if self.blocked.contains(digest) {
            Verdict::Deny
        } else {
            Verdict::Allow
        }
    }
}

/// Owner of all policy state.
#[derive(Debug, Default)]
pub struct PolicyStore {
    state: Mutex<PolicyState>,
}

impl PolicyStore {
    /// Create an empty store: nothing blocked, no grants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the blocked digest set wholesale.
    ///
    /// Digests absent from `entries` stop being blocked. Path mappings are
    /// merged, with the new entry winning for a path already known.
    pub fn replace_policy(&self, entries: &[BlockedEntry]) -> PolicySummary {
        let blocked: HashSet<Digest> = entries.iter().map(|e| e.digest.clone()).collect();
        let paths: HashMap<String, Digest> = entries
            .iter()
            .map(|e| (e.path.clone(), e.digest.clone()))
            .collect();
        let summary = PolicySummary {
            digests: blocked.len(),
            paths: paths.len(),
        };

        let mut state = self.state.lock();
        state.blocked = blocked;
        state.path_digests.extend(paths);
        summary
    }

    /// Whether `digest` is on the static block list.
    pub fn is_blocked(&self, digest: &Digest) -> bool {
        self.state.lock().blocked.contains(digest)
    }

    /// Let `digest` execute for `window` despite the block list.
    ///
    /// Returns the expiry instant.
    pub fn allow_temporarily(&self, digest: Digest, window: Duration) -> DateTime<Utc> {
        let now = Utc::now();
        let expires_at = now.checked_add_signed(window).unwrap_or(now);
        self.allow_temporarily_until(digest, expires_at);
        expires_at
    }

    /// Let `digest` execute until `expires_at`.
    pub fn allow_temporarily_until(&self, digest: Digest, expires_at: DateTime<Utc>) {
        self.state.lock().temporary_allows.insert(digest, expires_at);
    }

    /// Whether `digest` has an unexpired temporary allow window.
    pub fn is_temporarily_allowed(&self, digest: &Digest) -> bool {
        let now = Utc::now();
        self.state.lock().temporarily_allowed(digest, now)
    }

    /// Allow `pid` to access the protected configuration for `window`.
    pub fn grant_caller_access(&self, pid: Pid, window: Duration) -> DateTime<Utc> {
        let now = Utc::now();
        let expires_at = now.checked_add_signed(window).unwrap_or(now);
        let mut state = self.state.lock();
        if state.caller_grants.len() > CALLER_PRUNE_THRESHOLD {
            state.caller_grants.retain(|_, exp| *exp > now);
        }
        state.caller_grants.insert(pid, expires_at);
        expires_at
    }

    /// Whether `pid` holds an unexpired configuration access grant.
    pub fn is_caller_allowed(&self, pid: Pid) -> bool {
        let now = Utc::now();
        let mut state = self.state.lock();
        match state.caller_grants.get(&pid) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                state.caller_grants.remove(&pid);
                false
            }
            None => false,
        }
    }

    /// Decide for a freshly computed digest.
    ///
    /// An unexpired temporary allow wins over the block list.
    pub fn classify(&self, digest: &Digest) -> Verdict {
        let now = Utc::now();
        self.state.lock().classify(digest, now)
    }

    /// Fast-path decision for an executable path with a known digest.
    ///
    /// Returns `None` when the path has no digest mapping, or its digest is
    /// neither temporarily allowed nor blocked.
    pub fn fast_verdict(&self, path: &str) -> Option<(Digest, Verdict)> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let digest = state.path_digests.get(path)?.clone();
        if state.temporarily_allowed(&digest, now) {
            return Some((digest, Verdict::Allow));
        }
        if state.blocked.contains(&digest) {
            return Some((digest, Verdict::Deny));
        }
        None
    }

    /// Digest last associated with `path`, if any.
    pub fn digest_for_path(&self, path: &str) -> Option<Digest> {
        self.state.lock().path_digests.get(path).cloned()
    }

    /// Remember the digest computed for `path`.
    pub fn record_path_digest(&self, path: &str, digest: Digest) {
        self.state.lock().path_digests.insert(path.to_owned(), digest);
    }

    /// Forget digest mappings for `path` and anything beneath it.
    ///
    /// Returns the number of mappings removed.
    pub fn forget_path(&self, path: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.path_digests.len();
        state
            .path_digests
            .retain(|known, _| !cache::is_same_or_descendant(known, path));
        before.saturating_sub(state.path_digests.len())
    }

    /// Drop expired temporary allows and caller grants.
    pub fn sweep_expired(&self) -> SweepSummary {
        let now = Utc::now();
        let mut state = self.state.lock();
        let allows_before = state.temporary_allows.len();
        let grants_before = state.caller_grants.len();
        state.temporary_allows.retain(|_, exp| *exp > now);
        state.caller_grants.retain(|_, exp| *exp > now);
        SweepSummary {
            temporary_allows: allows_before.saturating_sub(state.temporary_allows.len()),
            caller_grants: grants_before.saturating_sub(state.caller_grants.len()),
        }
    }

    /// Number of blocked digests.
    pub fn blocked_count(&self) -> usize {
        self.state.lock().blocked.len()
    }

    /// Number of temporary allow windows held, expired or not.
    pub fn temporary_allow_count(&self) -> usize {
        self.state.lock().temporary_allows.len()
    }
}
