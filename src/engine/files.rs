//! File-event authorization: self-protection and cache coherence.

use tracing::{debug, warn};

use super::Engine;
use crate::monitor::{Event, ProcessInfo, FLAG_APPEND, FLAG_TRUNCATE, FLAG_WRITE};
use crate::policy::Verdict;
use crate::protection::{PathClass, TrustReason};
use crate::valve::AuthorizationValve;

/// One path touched by a file event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAccess {
    /// Path touched.
    pub path: String,
    /// Whether the event can change what is at `path`.
    pub mutates: bool,
}

impl FileAccess {
    fn read(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            mutates: false,
        }
    }

    fn write(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mutates: true,
        }
    }
}

/// Paths an event touches. Exec and unknown events touch none.
pub fn file_accesses(event: &Event) -> Vec<FileAccess> {
    match event {
        Event::Open { path, flags } => {
            if flags & (FLAG_WRITE | FLAG_APPEND | FLAG_TRUNCATE) != 0 {
                vec![FileAccess::write(path.as_str())]
            } else {
                vec![FileAccess::read(path)]
            }
        }
        Event::Unlink { path } | Event::Truncate { path } => vec![FileAccess::write(path.as_str())],
        Event::Rename {
            source,
            destination,
        } => vec![
            FileAccess::write(source.as_str()),
            FileAccess::write(destination.path()),
        ],
        Event::ExchangeData { file1, file2 } => vec![
            FileAccess::write(file1.as_str()),
            FileAccess::write(file2.as_str()),
        ],
        Event::Clone {
            source,
            target_dir,
            target_name,
        } => vec![
            FileAccess::read(source),
            FileAccess::write(crate::monitor::join(target_dir, target_name)),
        ],
        // A new name for a protected inode is as good as write access to it.
        Event::Link {
            source,
            target_dir,
            target_name,
        } => vec![
            FileAccess::write(source.as_str()),
            FileAccess::write(crate::monitor::join(target_dir, target_name)),
        ],
        Event::Exec { .. } | Event::Other { .. } => Vec::new(),
    }
}

impl Engine {
    /// Decide a file event for `process`. Returns the verdict and whether the
    /// kernel may cache it.
    ///
    /// Allowed mutations invalidate cached identity for every path written.
    pub fn file_decision(&self, event: &Event, process: &ProcessInfo) -> (Verdict, bool) {
        let accesses = file_accesses(event);
        let mut cacheable = true;

        for access in &accesses {
            let class = self.protection.classify(&access.path);
            let permitted = match (class, access.mutates) {
                (PathClass::Unrelated, _)
                | (PathClass::OwnBundle, false)
                | (PathClass::ProtectedDir, false) => true,
                (PathClass::ConfigFile, false) => {
                    self.trusted_caller(process).is_some()
                        || self.policy.is_caller_allowed(process.pid)
                }
                (_, true) => self.trusted_caller(process).is_some(),
            };
            if !permitted {
                warn!(
                    path = %access.path,
                    pid = process.pid,
                    executable = %process.executable.display(),
                    class = ?class,
                    mutates = access.mutates,
                    "denied access to protected path"
                );
                return (Verdict::Deny, false);
            }
            if access.mutates || matches!(class, PathClass::ConfigFile | PathClass::ProtectedDir)
            {
                cacheable = false;
            }
        }

        for access in accesses.iter().filter(|a| a.mutates) {
            self.invalidate(&access.path);
        }
        (Verdict::Allow, cacheable)
    }

    pub(super) fn authorize_file(&self, valve: &AuthorizationValve) {
        let message = valve.message();
        let (verdict, cache) = self.file_decision(&message.event, &message.process);
        valve.respond(verdict, cache);
    }

    fn trusted_caller(&self, process: &ProcessInfo) -> Option<TrustReason> {
        let reason = self
            .protection
            .authorize_caller(process, self.main_app_pid());
        if let Some(reason) = reason {
            debug!(pid = process.pid, reason = ?reason, "trusted caller");
        }
        reason
    }
}
