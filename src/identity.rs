//! Content identity: streaming SHA-256 digest of an executable file.
//!
//! The digest is the unit of policy. Files are read in fixed-size blocks and
//! never loaded whole. Only the first [`DEFAULT_READ_LIMIT`] bytes are hashed
//! by default; the privileged application computes policy digests with the
//! same limit, so both sides must agree or no digest will ever match.

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Number of leading bytes hashed by default (5 MiB).
pub const DEFAULT_READ_LIMIT: u64 = 5 * 1024 * 1024;

/// Default read block size (256 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;

/// Smallest block size accepted; smaller configured values are raised to this.
pub const MIN_BLOCK_SIZE: usize = 64 * 1024;

/// Length of a hex-encoded SHA-256 digest.
const HEX_LEN: usize = 64;

/// Errors produced while establishing content identity.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// The file could not be opened or read.
    #[error("failed to read {} for hashing: {source}", path.display())]
    Read {
        /// File that could not be hashed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A digest string was not 64 hex characters.
    #[error("malformed digest {0:?}: expected 64 hex characters")]
    Malformed(String),
}

/// Lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse a hex digest, normalising to lowercase.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError::Malformed`] unless the input is exactly 64 hex
    /// characters.
    pub fn parse(text: &str) -> Result<Self, DigestError> {
        let trimmed = text.trim();
        if trimmed.len() != HEX_LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::Malformed(text.to_owned()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// Digest of an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

/// Tuning for [`digest_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestOptions {
    /// Hash at most this many leading bytes. `None` hashes the whole file.
    pub read_limit: Option<u64>,
    /// Read block size in bytes.
    pub block_size: usize,
}

impl Default for DigestOptions {
    fn default() -> Self {
        Self {
            read_limit: Some(DEFAULT_READ_LIMIT),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Stream a file through SHA-256 and return its digest.
///
/// # Errors
///
/// Returns [`DigestError::Read`] when the file cannot be opened or a read
/// fails part-way. Callers must treat this as deny: identity that cannot be
/// established never grants execution.
pub fn digest_of(path: &Path, opts: DigestOptions) -> Result<Digest, DigestError> {
    let read_err = |source| DigestError::Read {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(read_err)?;
    let mut reader = file.take(opts.read_limit.unwrap_or(u64::MAX));
    let mut hasher = Sha256::new();
    let mut block = vec![0u8; opts.block_size.max(MIN_BLOCK_SIZE)];

    loop {
        let read = match reader.read(&mut block) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_err(e)),
        };
        hasher.update(block.get(..read).unwrap_or_default());
    }

    Ok(Digest(hex::encode(hasher.finalize())))
}
