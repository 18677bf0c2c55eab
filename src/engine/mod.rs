//! The decision engine: one long-lived handle owning all policy state.
//!
//! Built once at startup and shared by `Arc` with the event clients and the
//! control server. Tests construct a fresh engine each.

mod exec;
mod files;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::identity::Digest;
use crate::monitor::{Event, MonitorClient, PathMatch, Pid};
use crate::notify::NotifierHandle;
use crate::policy::cache::DecisionCache;
use crate::policy::{BlockedEntry, PolicyStore, PolicySummary, SweepSummary, Verdict};
use crate::protection::SelfProtection;
use crate::valve::{AuthorizationValve, DeadlinePolicy};

pub use exec::{deny_delay, DecisionSource, ExecDecision};
pub use files::{file_accesses, FileAccess};

/// Language assumed until the privileged application sets one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Authorization engine.
pub struct Engine {
    config: EngineConfig,
    policy: PolicyStore,
    cache: DecisionCache,
    protection: SelfProtection,
    notifier: NotifierHandle,
    main_app_pid: Mutex<Option<Pid>>,
    language: Mutex<String>,
    in_flight: Arc<AtomicUsize>,
    workers: Arc<Semaphore>,
    tamper_monitor: Mutex<Option<Arc<dyn MonitorClient>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("blocked", &self.policy.blocked_count())
            .field("cached", &self.cache.len())
            .field("in_flight", &self.in_flight())
            .field("main_app_pid", &self.main_app_pid())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine with empty policy.
    pub fn new(config: EngineConfig, protection: SelfProtection, notifier: NotifierHandle) -> Self {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            config,
            policy: PolicyStore::new(),
            cache: DecisionCache::new(),
            protection,
            notifier,
            main_app_pid: Mutex::new(None),
            language: Mutex::new(DEFAULT_LANGUAGE.to_owned()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            workers,
            tamper_monitor: Mutex::new(None),
        }
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Policy state.
    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    /// Exec decision memo.
    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    /// Path classifier and caller authorizer.
    pub fn protection(&self) -> &SelfProtection {
        &self.protection
    }

    /// Deadline split used for every valve.
    pub fn deadline_policy(&self) -> DeadlinePolicy {
        self.config.deadline_policy()
    }

    /// Shared counter of unanswered authorization messages.
    pub fn in_flight_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.in_flight)
    }

    /// Unanswered authorization messages right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Wait for a decision worker slot.
    ///
    /// # Errors
    ///
    /// Fails only if the pool has been closed.
    pub async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.workers).acquire_owned().await
    }

    /// Register the monitor carrying file events so newly blocked
    /// executables are watched for mutation.
    pub fn attach_tamper_monitor(&self, monitor: Arc<dyn MonitorClient>) {
        *self.tamper_monitor.lock() = Some(monitor);
    }

    /// Replace the blocked set wholesale.
    ///
    /// The decision cache is cleared so no memo computed against the old
    /// set survives, and each entry's path is added to the watched paths.
    pub fn replace_policy(&self, entries: &[BlockedEntry]) -> PolicySummary {
        let summary = self.policy.replace_policy(entries);
        self.cache.clear();

        let monitor = self.tamper_monitor.lock().clone();
        if let Some(monitor) = monitor {
            for entry in entries {
                if let Err(e) = monitor.watch_path(&entry.path, PathMatch::Literal) {
                    warn!(path = %entry.path, error = %e, "failed to watch policy path");
                }
            }
        }

        info!(
            digests = summary.digests,
            paths = summary.paths,
            "policy replaced"
        );
        summary
    }

    /// Open the temporary allow window for `digest`.
    pub fn allow_temporarily(&self, digest: Digest) -> DateTime<Utc> {
        let short = digest.short().to_owned();
        let expires_at = self
            .policy
            .allow_temporarily(digest, self.config.temp_allow_window());
        info!(digest = %short, expires_at = %expires_at, "temporary allow granted");
        expires_at
    }

    /// Let `pid` read the protected configuration for the caller access window.
    pub fn grant_caller_access(&self, pid: Pid) -> DateTime<Utc> {
        let expires_at = self
            .policy
            .grant_caller_access(pid, self.config.caller_access_window());
        info!(pid, expires_at = %expires_at, "configuration access granted");
        expires_at
    }

    /// Store the language code for notices.
    pub fn set_preferred_language(&self, code: &str) {
        *self.language.lock() = code.to_owned();
        info!(language = code, "preferred language set");
    }

    /// Current language code.
    pub fn preferred_language(&self) -> String {
        self.language.lock().clone()
    }

    /// Record the authenticated main application's pid.
    pub fn set_main_app_pid(&self, pid: Pid) {
        let previous = self.main_app_pid.lock().replace(pid);
        if previous != Some(pid) {
            info!(pid, ?previous, "main application pid updated");
        }
    }

    /// Authenticated main application's pid, once known.
    pub fn main_app_pid(&self) -> Option<Pid> {
        *self.main_app_pid.lock()
    }

    /// Drop every memo and digest mapping for `path` and its descendants.
    pub fn invalidate(&self, path: &str) {
        let memos = self.cache.invalidate(path);
        let digests = self.policy.forget_path(path);
        if memos > 0 || digests > 0 {
            debug!(path, memos, digests, "invalidated cached identity");
        }
    }

    /// Drop expired temporary allows and grants.
    pub fn sweep(&self) -> SweepSummary {
        self.policy.sweep_expired()
    }

    /// Decide the message held by `valve` and respond through it.
    ///
    /// Blocking: hashing happens here. Call from a worker thread.
    pub fn decide(&self, valve: &AuthorizationValve) {
        match &valve.message().event {
            Event::Exec { .. } => self.authorize_exec(valve),
            Event::Open { .. }
            | Event::Unlink { .. }
            | Event::Rename { .. }
            | Event::Truncate { .. }
            | Event::ExchangeData { .. }
            | Event::Clone { .. }
            | Event::Link { .. } => self.authorize_file(valve),
            Event::Other { code } => {
                debug!(code, "unhandled event kind, allowing");
                valve.respond(Verdict::Allow, false);
            }
        }
    }
}

/// Sweep expired entries every `engine.config().sweep_interval()` until
/// `shutdown` flips to `true`.
pub async fn run_sweeper(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(engine.config().sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let swept = engine.sweep();
                if swept.temporary_allows > 0 || swept.caller_grants > 0 {
                    debug!(
                        temporary_allows = swept.temporary_allows,
                        caller_grants = swept.caller_grants,
                        "expired entries swept"
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("sweeper stopped");
}
