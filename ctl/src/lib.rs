//! Helpers for `execguard-ctl`: policy file loading and request building.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use execguard::control::protocol::Request;
use execguard::identity::Digest;
use execguard::monitor::Pid;
use execguard::policy::BlockedEntry;

/// Accepted policy file shapes: a bare array or `{"entries": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PolicyFile {
    Bare(Vec<BlockedEntry>),
    Wrapped { entries: Vec<BlockedEntry> },
}

/// Parse policy entries from JSON text.
///
/// # Errors
///
/// Returns an error on malformed JSON, missing fields, or bad digests.
pub fn parse_policy(text: &str) -> anyhow::Result<Vec<BlockedEntry>> {
    let file: PolicyFile = serde_json::from_str(text).context("invalid policy JSON")?;
    Ok(match file {
        PolicyFile::Bare(entries) | PolicyFile::Wrapped { entries } => entries,
    })
}

/// Read policy entries from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_policy(path: &Path) -> anyhow::Result<Vec<BlockedEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    parse_policy(&text).with_context(|| format!("in {}", path.display()))
}

/// `replace_policy` request for `entries`.
pub fn replace_policy(entries: Vec<BlockedEntry>) -> Request {
    Request::ReplacePolicy { entries }
}

/// `allow_temporarily` request for a hex digest.
///
/// # Errors
///
/// Returns an error unless `digest` is 64 hex characters.
pub fn allow(digest: &str) -> anyhow::Result<Request> {
    let digest = Digest::parse(digest)?;
    Ok(Request::AllowTemporarily { digest })
}

/// `grant_caller_access` request.
pub fn grant(pid: Pid) -> Request {
    Request::GrantCallerAccess { pid }
}

/// `set_preferred_language` request.
pub fn language(code: &str) -> Request {
    Request::SetPreferredLanguage {
        code: code.to_owned(),
    }
}
