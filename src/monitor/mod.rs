//! Kernel monitor boundary.
//!
//! The monitor delivers security events and accepts exactly one response per
//! authorization-class event before its deadline. This module defines the
//! event model as a closed set of variants, the owned message wrapper handed
//! to the valve, and the [`MonitorClient`] trait used to talk back.

pub mod feed;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::policy::Verdict;

/// OS process identifier.
pub type Pid = i32;

/// `FREAD` open flag.
pub const FLAG_READ: u32 = 0x0001;
/// `FWRITE` open flag.
pub const FLAG_WRITE: u32 = 0x0002;
/// `O_APPEND` open flag.
pub const FLAG_APPEND: u32 = 0x0008;
/// `O_TRUNC` open flag.
pub const FLAG_TRUNCATE: u32 = 0x0400;

/// Flag mask granting every requested open flag.
pub const ALL_FLAGS: u32 = u32::MAX;

/// Identity of the process that triggered an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process id.
    pub pid: Pid,
    /// Parent process id.
    pub ppid: Pid,
    /// Code-signing identifier, when the binary is signed.
    #[serde(default)]
    pub signing_id: Option<String>,
    /// Path of the executable image.
    pub executable: PathBuf,
    /// Controlling terminal device, when the process has one.
    #[serde(default)]
    pub tty: Option<PathBuf>,
}

/// Destination of a rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenameDestination {
    /// Rename over an existing file.
    ExistingFile {
        /// Path of the file being replaced.
        path: String,
    },
    /// Rename to a path that does not exist yet.
    NewPath {
        /// Parent directory.
        dir: String,
        /// New file name.
        filename: String,
    },
}

impl RenameDestination {
    /// Full destination path.
    pub fn path(&self) -> String {
        match self {
            Self::ExistingFile { path } => path.clone(),
            Self::NewPath { dir, filename } => join(dir, filename),
        }
    }
}

/// Subscribable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// About to execute a binary.
    Exec,
    /// About to open a file.
    Open,
    /// About to unlink a file.
    Unlink,
    /// About to rename a file.
    Rename,
    /// About to truncate a file.
    Truncate,
    /// About to swap the contents of two files.
    ExchangeData,
    /// About to clone a file.
    Clone,
    /// About to create a hard link.
    Link,
}

/// File-mutation kinds watched for self-protection and cache coherence.
pub const FILE_EVENT_KINDS: [EventKind; 7] = [
    EventKind::Open,
    EventKind::Unlink,
    EventKind::Rename,
    EventKind::Truncate,
    EventKind::ExchangeData,
    EventKind::Clone,
    EventKind::Link,
];

/// Event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// A process is about to execute `path`.
    Exec {
        /// Executable being launched.
        path: String,
        /// Signing identifier of the target executable.
        #[serde(default)]
        signing_id: Option<String>,
    },
    /// A file is about to be opened with `flags`.
    Open {
        /// File being opened.
        path: String,
        /// Kernel open flags (`FREAD`, `FWRITE`, ...).
        flags: u32,
    },
    /// A file is about to be unlinked.
    Unlink {
        /// File being removed.
        path: String,
    },
    /// A file is about to be renamed.
    Rename {
        /// Current path.
        source: String,
        /// Where it is going.
        destination: RenameDestination,
    },
    /// A file is about to be truncated.
    Truncate {
        /// File being truncated.
        path: String,
    },
    /// Two files are about to swap contents.
    ExchangeData {
        /// First file.
        file1: String,
        /// Second file.
        file2: String,
    },
    /// A file is about to be cloned into `target_dir`.
    Clone {
        /// File being cloned.
        source: String,
        /// Directory receiving the clone.
        target_dir: String,
        /// Name of the clone.
        target_name: String,
    },
    /// A hard link is about to be created in `target_dir`.
    Link {
        /// File being linked.
        source: String,
        /// Directory receiving the link.
        target_dir: String,
        /// Name of the link.
        target_name: String,
    },
    /// Any event type this engine does not handle.
    Other {
        /// Raw kernel event code.
        code: u32,
    },
}

impl Event {
    /// Kind of this event, `None` for [`Event::Other`].
    pub fn kind(&self) -> Option<EventKind> {
        Some(match self {
            Self::Exec { .. } => EventKind::Exec,
            Self::Open { .. } => EventKind::Open,
            Self::Unlink { .. } => EventKind::Unlink,
            Self::Rename { .. } => EventKind::Rename,
            Self::Truncate { .. } => EventKind::Truncate,
            Self::ExchangeData { .. } => EventKind::ExchangeData,
            Self::Clone { .. } => EventKind::Clone,
            Self::Link { .. } => EventKind::Link,
            Self::Other { .. } => return None,
        })
    }

    /// Primary path for log lines.
    pub fn primary_path(&self) -> String {
        match self {
            Self::Exec { path, .. }
            | Self::Open { path, .. }
            | Self::Unlink { path }
            | Self::Truncate { path } => path.clone(),
            Self::Rename { source, .. } => source.clone(),
            Self::ExchangeData { file1, .. } => file1.clone(),
            Self::Clone {
                target_dir,
                target_name,
                ..
            }
            | Self::Link {
                target_dir,
                target_name,
                ..
            } => join(target_dir, target_name),
            Self::Other { code } => format!("event-{code}"),
        }
    }
}

/// Whether the monitor blocks on a response or only informs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// The originating process waits for a response.
    Auth,
    /// Informational only; no response expected.
    Notify,
}

/// One kernel message, owned for the lifetime of its valve.
#[derive(Debug, Clone)]
pub struct AuthMessage {
    /// Monitor-assigned sequence id, echoed in the response.
    pub id: u64,
    /// Auth or notify.
    pub action: Action,
    /// Event payload.
    pub event: Event,
    /// Process that triggered the event.
    pub process: ProcessInfo,
    /// Instant after which the kernel terminates the waiting process.
    pub deadline: Instant,
}

impl AuthMessage {
    /// Time left until the kernel deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether a response is owed.
    pub fn is_auth(&self) -> bool {
        self.action == Action::Auth
    }
}

/// Response sent back to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthResponse {
    /// Plain allow/deny.
    Auth {
        /// Decision.
        verdict: Verdict,
        /// Whether the kernel may cache the decision.
        cache: bool,
    },
    /// Open-class events are answered with the set of permitted flags.
    Flags {
        /// Permitted open flags.
        flags: u32,
        /// Whether the kernel may cache the decision.
        cache: bool,
    },
}

impl AuthResponse {
    /// Build the correct response shape for `event`.
    pub fn for_event(event: &Event, verdict: Verdict, cache: bool) -> Self {
        match event {
            Event::Open { .. } => Self::Flags {
                flags: if verdict.is_deny() { 0 } else { ALL_FLAGS },
                cache,
            },
            _ => Self::Auth { verdict, cache },
        }
    }

    /// Whether this response lets the operation proceed.
    pub fn allows(&self) -> bool {
        match self {
            Self::Auth { verdict, .. } => !verdict.is_deny(),
            Self::Flags { flags, .. } => *flags != 0,
        }
    }
}

/// How a watched path is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatch {
    /// Exact path.
    Literal,
    /// Path and everything beneath it.
    Prefix,
}

/// Errors from the monitor interface.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The monitor connection is gone.
    #[error("monitor disconnected")]
    Disconnected,
    /// The monitor rejected a request.
    #[error("monitor rejected {operation}: {detail}")]
    Rejected {
        /// Operation that failed.
        operation: &'static str,
        /// Monitor-provided detail.
        detail: String,
    },
}

/// Commands the engine issues to the kernel monitor.
///
/// Implementations must not block: `respond` is called on the
/// response-critical path.
pub trait MonitorClient: Send + Sync {
    /// Answer an authorization-class message.
    fn respond(&self, message: &AuthMessage, response: AuthResponse) -> Result<(), MonitorError>;

    /// Exclude this process from generating events.
    fn mute_self(&self) -> Result<(), MonitorError>;

    /// Clear all target-path mutes.
    fn unmute_all_target_paths(&self) -> Result<(), MonitorError>;

    /// Invert target-path muting so that muted paths become the only ones
    /// that generate events.
    fn invert_target_path_muting(&self) -> Result<(), MonitorError>;

    /// Mute (or, once inverted, watch) a target path.
    fn watch_path(&self, path: &str, matching: PathMatch) -> Result<(), MonitorError>;

    /// Start receiving the given event kinds.
    fn subscribe(&self, kinds: &[EventKind]) -> Result<(), MonitorError>;
}

/// Join a directory and a file name with exactly one separator.
pub fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}
