//! Content hashing for model files
//!
//! Hashes are SHA-256 digests rendered as 64 lowercase hex characters. Files
//! are streamed through the hasher in fixed-size blocks so multi-gigabyte
//! checkpoints never have to fit in memory.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::str::FromStr;

/// Block size used when streaming a file through the hasher
pub const HASH_CHUNK_SIZE: usize = 8 * 1024;

/// A validated SHA-256 digest: exactly 64 characters in `[0-9a-f]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

/// Returned when a string is not a valid content hash
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a valid SHA-256 hex digest: {0:?}")]
pub struct InvalidHash(pub String);

impl ContentHash {
    /// Parse a stored hash value
    ///
    /// Surrounding whitespace is ignored and uppercase hex is normalized to
    /// lowercase, matching how older sidecar files stored their digests.
    pub fn parse(value: &str) -> Result<Self, InvalidHash> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized.len() == 64 && normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(normalized))
        } else {
            Err(InvalidHash(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used in log lines
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = InvalidHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// Compute the SHA-256 digest of a file using [`HASH_CHUNK_SIZE`] blocks
pub fn compute_hash(path: &Path) -> SyncResult<ContentHash> {
    compute_hash_with_chunk_size(path, HASH_CHUNK_SIZE)
}

/// Compute the SHA-256 digest of a file reading `chunk_size` bytes at a time
///
/// The digest depends only on the file's bytes, never on the block size.
pub fn compute_hash_with_chunk_size(path: &Path, chunk_size: usize) -> SyncResult<ContentHash> {
    let mut file = File::open(path).map_err(|e| SyncError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];

    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SyncError::io(path, e)),
        };
        hasher.update(&buffer[..read]);
    }

    Ok(ContentHash(format!("{:x}", hasher.finalize())))
}
