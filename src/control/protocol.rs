//! Control-channel frames.
//!
//! One JSON object per line. Binary fields (nonces, signatures, public keys)
//! are standard base64.

use serde::{Deserialize, Serialize};

use super::handshake::HelloProof;
use crate::identity::Digest;
use crate::monitor::Pid;
use crate::policy::BlockedEntry;

/// Frames sent by the privileged application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// First leg of the handshake.
    Authenticate(HelloProof),
    /// Replace the blocked set wholesale.
    ReplacePolicy {
        /// New protected applications.
        entries: Vec<BlockedEntry>,
    },
    /// Let a blocked digest run for the temporary allow window.
    AllowTemporarily {
        /// Digest to allow.
        digest: Digest,
    },
    /// Let a process read the protected configuration briefly.
    GrantCallerAccess {
        /// Process to grant.
        pid: Pid,
    },
    /// Language for terminal notices.
    SetPreferredLanguage {
        /// Language code, e.g. `en`.
        code: String,
    },
}

impl Request {
    /// Whether the request requires an authenticated connection.
    pub fn is_privileged(&self) -> bool {
        !matches!(self, Self::Authenticate(_))
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "authenticate",
            Self::ReplacePolicy { .. } => "replace_policy",
            Self::AllowTemporarily { .. } => "allow_temporarily",
            Self::GrantCallerAccess { .. } => "grant_caller_access",
            Self::SetPreferredLanguage { .. } => "set_preferred_language",
        }
    }
}

/// Frames sent by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Second leg of the handshake.
    Authenticated(HelloProof),
    /// Privileged request applied.
    Ack,
    /// The connection has not completed the handshake, or it failed.
    Unauthorized,
    /// The request was understood but could not be applied.
    Error {
        /// What went wrong.
        message: String,
    },
    /// Pushed to authenticated peers when an exec is denied.
    BlockedNotice {
        /// Display name of the application.
        name: String,
        /// Executable path.
        path: String,
        /// Content digest, when established.
        digest: Option<Digest>,
    },
}

/// Serde adapter for base64-encoded byte fields.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
