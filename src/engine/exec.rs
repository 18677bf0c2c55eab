//! Exec authorization: fast path, cache path, slow path.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::Engine;
use crate::identity::{digest_of, Digest};
use crate::monitor::Event;
use crate::notify::{app_name_for, BlockedNotice};
use crate::policy::Verdict;
use crate::valve::AuthorizationValve;

/// Time kept free before the deadline when delaying a deny.
const DENY_SAFETY_BUFFER: Duration = Duration::from_secs(1);

/// Deny delays shorter than this are skipped.
const MIN_DENY_DELAY: Duration = Duration::from_millis(10);

/// Which path produced an exec decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// Known digest for the path that is temporarily allowed or blocked.
    Fast,
    /// Memoized verdict for the path.
    Cache,
    /// Freshly hashed and classified.
    Hashed,
    /// The file could not be read; identity unknown.
    Unreadable,
    /// Too little time left before the deadline to hash.
    OutOfTime,
}

/// Outcome of an exec decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecDecision {
    /// Allow or deny.
    pub verdict: Verdict,
    /// Digest behind the decision, when known.
    pub digest: Option<Digest>,
    /// How it was reached.
    pub source: DecisionSource,
}

/// Pause before sending a deny: at most `max`, never closer than one second
/// to the deadline.
pub fn deny_delay(max: Duration, remaining: Duration) -> Duration {
    max.min(remaining.saturating_sub(DENY_SAFETY_BUFFER))
}

impl Engine {
    /// Decide whether `path` may execute with `remaining` time to spare.
    ///
    /// Never grants execution when identity cannot be established.
    pub fn exec_decision(&self, path: &str, remaining: Duration) -> ExecDecision {
        if let Some((digest, verdict)) = self.policy.fast_verdict(path) {
            return ExecDecision {
                verdict,
                digest: Some(digest),
                source: DecisionSource::Fast,
            };
        }

        if let Some(verdict) = self.cache.get(path) {
            return ExecDecision {
                verdict,
                digest: self.policy.digest_for_path(path),
                source: DecisionSource::Cache,
            };
        }

        let required = Duration::from_millis(self.config.hash_time_required_ms);
        if remaining < required {
            warn!(
                path,
                remaining_ms = remaining.as_millis(),
                "not enough time left to hash, denying"
            );
            return ExecDecision {
                verdict: Verdict::Deny,
                digest: None,
                source: DecisionSource::OutOfTime,
            };
        }

        match digest_of(Path::new(path), self.config.digest_options()) {
            Ok(digest) => {
                let verdict = self.policy.classify(&digest);
                self.policy.record_path_digest(path, digest.clone());
                self.cache.insert(path, verdict);
                ExecDecision {
                    verdict,
                    digest: Some(digest),
                    source: DecisionSource::Hashed,
                }
            }
            Err(e) => {
                warn!(path, error = %e, "cannot establish identity, denying");
                ExecDecision {
                    verdict: Verdict::Deny,
                    digest: None,
                    source: DecisionSource::Unreadable,
                }
            }
        }
    }

    pub(super) fn authorize_exec(&self, valve: &AuthorizationValve) {
        let message = valve.message();
        let Event::Exec { path, signing_id } = &message.event else {
            valve.respond(Verdict::Allow, false);
            return;
        };

        let decision = self.exec_decision(path, message.remaining());

        if decision.verdict.is_deny() {
            let delay = deny_delay(
                Duration::from_millis(self.config.deny_delay_ms),
                message.remaining(),
            );
            if delay >= MIN_DENY_DELAY {
                std::thread::sleep(delay);
            }
        }

        // Exec responses are never kernel-cached so policy changes apply on
        // the next launch.
        if !valve.respond(decision.verdict, false) {
            warn!(
                path = %path,
                verdict = ?decision.verdict,
                source = ?decision.source,
                "decision finished after the deadline response"
            );
            return;
        }

        match decision.verdict {
            Verdict::Allow => debug!(path = %path, source = ?decision.source, "exec allowed"),
            Verdict::Deny => {
                info!(
                    path = %path,
                    pid = message.process.pid,
                    ppid = message.process.ppid,
                    digest = decision.digest.as_ref().map(Digest::short).unwrap_or("-"),
                    source = ?decision.source,
                    "exec denied"
                );
                self.notifier.notify(BlockedNotice {
                    name: app_name_for(path),
                    path: path.clone(),
                    digest: decision.digest,
                    signing_id: signing_id
                        .clone()
                        .or_else(|| message.process.signing_id.clone()),
                    parent_pid: message.process.ppid,
                    tty: message.process.tty.clone(),
                });
            }
        }
    }
}
