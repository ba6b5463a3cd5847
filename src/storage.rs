//! Durable file writes for sidecar records and configuration

use crate::models::sidecar::SidecarRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically, creating parent directories
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> Result<Option<String>>;
}

/// Sibling path used while a write is in flight: `name.json` -> `name.json.tmp`
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        // Atomic write: write to temp file, then rename
        let temp_file = temp_path_for(path);

        let written = async {
            let mut file = fs::File::create(&temp_file)
                .await
                .context("Failed to create temp file")?;
            file.write_all(content.as_bytes())
                .await
                .context("Failed to write temp file")?;
            file.sync_all().await.context("Failed to sync temp file")?;
            fs::rename(&temp_file, path)
                .await
                .context("Failed to rename temp file")
        }
        .await;

        if written.is_err() {
            let _ = fs::remove_file(&temp_file).await;
        }
        written.with_context(|| format!("Failed to save {:?}", path))
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read file: {:?}", path)),
        }
    }
}

// ============================================================================
// Sidecar Writer
// ============================================================================

/// Serializes sidecar records and persists them through a storage backend
#[derive(Clone)]
pub struct SidecarWriter {
    storage: Arc<dyn StorageBackend>,
}

impl SidecarWriter {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Write `record` to `path`
    ///
    /// Either the complete record replaces the old file or the old file is
    /// left untouched; failures come back as errors for the caller to count.
    pub async fn write(&self, path: &Path, record: &SidecarRecord) -> Result<()> {
        let content = record
            .to_json_pretty()
            .context("Failed to serialize sidecar record")?;
        self.storage.save(path, &content).await?;

        tracing::debug!(sidecar = %path.display(), "Sidecar saved");
        Ok(())
    }
}

impl Default for SidecarWriter {
    fn default() -> Self {
        Self::new(Arc::new(FileSystemStorage::new()))
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use tokio::sync::RwLock;

    /// Filesystem storage that fails saves for paths whose file name contains
    /// one of the configured markers
    pub struct FailingStorage {
        inner: FileSystemStorage,
        fail_markers: RwLock<Vec<String>>,
    }

    impl Default for FailingStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    impl FailingStorage {
        pub fn new() -> Self {
            Self {
                inner: FileSystemStorage::new(),
                fail_markers: RwLock::new(Vec::new()),
            }
        }

        pub async fn fail_when_name_contains(&self, marker: &str) {
            self.fail_markers.write().await.push(marker.to_string());
        }
    }

    #[async_trait]
    impl StorageBackend for FailingStorage {
        async fn save(&self, path: &Path, content: &str) -> Result<()> {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if self
                .fail_markers
                .read()
                .await
                .iter()
                .any(|m| name.contains(m.as_str()))
            {
                anyhow::bail!("Injected write failure for {:?}", path);
            }
            self.inner.save(path, content).await
        }

        async fn load(&self, path: &Path) -> Result<Option<String>> {
            self.inner.load(path).await
        }
    }
}
