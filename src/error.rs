//! Error types for the sync library

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by scanning, hashing and reconciliation
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Folder not found: {0}")]
    RootNotFound(PathBuf),

    #[error("Path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Every candidate in a hashing batch failed structural validation
    #[error("No valid safetensors files found ({rejected} rejected)")]
    NoValidFiles { rejected: usize },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A background hashing task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mentions_path() {
        let err = SyncError::io(
            "/models/a.safetensors",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/models/a.safetensors"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn test_no_valid_files_message() {
        let err = SyncError::NoValidFiles { rejected: 3 };
        assert_eq!(
            err.to_string(),
            "No valid safetensors files found (3 rejected)"
        );
    }
}
