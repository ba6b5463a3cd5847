//! Structural validation of safetensors containers
//!
//! A safetensors file starts with an 8-byte little-endian header length
//! followed by a UTF-8 JSON object describing the tensors. This is a sniff
//! test run before a file is trusted enough to hash, not a full parse.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Files shorter than this cannot hold a header plus any tensor data
pub const MIN_CONTAINER_SIZE: u64 = 100;

/// Smallest plausible JSON header
pub const MIN_HEADER_LEN: u64 = 10;

/// Upper bound on the JSON header, matching the safetensors format limit
pub const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

/// Summary of a header that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub header_len: u64,
    pub tensor_count: usize,
    pub has_metadata: bool,
}

/// Why a file was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Missing,
    TooSmall { size: u64 },
    HeaderLength { header_len: u64, file_size: u64 },
    TruncatedHeader,
    InvalidUtf8,
    InvalidJson(String),
    NotAnObject,
    Unreadable(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Missing => write!(f, "file does not exist"),
            Rejection::TooSmall { size } => {
                write!(f, "file too small to be a safetensors file ({} bytes)", size)
            }
            Rejection::HeaderLength {
                header_len,
                file_size,
            } => write!(
                f,
                "invalid header length {} for file of {} bytes",
                header_len, file_size
            ),
            Rejection::TruncatedHeader => write!(f, "could not read full header"),
            Rejection::InvalidUtf8 => write!(f, "header is not valid UTF-8"),
            Rejection::InvalidJson(e) => write!(f, "header is not valid JSON: {}", e),
            Rejection::NotAnObject => write!(f, "header is not a JSON object"),
            Rejection::Unreadable(e) => write!(f, "error reading file: {}", e),
        }
    }
}

/// Inspect a container header, returning the reason when it is rejected
pub fn inspect_container(path: &Path) -> Result<ContainerHeader, Rejection> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(Rejection::Missing),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Rejection::Missing),
        Err(e) => return Err(Rejection::Unreadable(e.to_string())),
    };

    let file_size = metadata.len();
    if file_size < MIN_CONTAINER_SIZE {
        return Err(Rejection::TooSmall { size: file_size });
    }

    let mut file = File::open(path).map_err(|e| Rejection::Unreadable(e.to_string()))?;

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .map_err(|_| Rejection::TruncatedHeader)?;
    let header_len = u64::from_le_bytes(len_bytes);

    if header_len < MIN_HEADER_LEN || header_len > file_size - 8 || header_len > MAX_HEADER_LEN {
        return Err(Rejection::HeaderLength {
            header_len,
            file_size,
        });
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)
        .map_err(|_| Rejection::TruncatedHeader)?;

    let text = std::str::from_utf8(&header).map_err(|_| Rejection::InvalidUtf8)?;
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Rejection::InvalidJson(e.to_string()))?;
    let object = value.as_object().ok_or(Rejection::NotAnObject)?;

    let has_metadata = object.contains_key("__metadata__");
    Ok(ContainerHeader {
        header_len,
        tensor_count: object.keys().filter(|k| *k != "__metadata__").count(),
        has_metadata,
    })
}

/// Returns true when the file looks like a well-formed safetensors container
///
/// A header without `__metadata__` is accepted with a warning.
pub fn validate_container(path: &Path) -> bool {
    match inspect_container(path) {
        Ok(header) => {
            if !header.has_metadata {
                tracing::warn!(
                    file = %path.display(),
                    "Safetensors header has no __metadata__ entry"
                );
            }
            true
        }
        Err(reason) => {
            tracing::debug!(file = %path.display(), reason = %reason, "Container rejected");
            false
        }
    }
}
