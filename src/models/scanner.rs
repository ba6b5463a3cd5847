//! Local model discovery and sidecar inspection
//!
//! Walks a directory tree for safetensors files and reports, per file, what
//! its sidecar already knows. Layout:
//! ```text
//! models/
//! ├── style.safetensors
//! ├── style.json              <- sidecar record
//! ├── style.preview.jpg       <- preview image
//! └── characters/
//!     ├── hero.safetensors
//!     └── hero.json
//! ```

use super::hash::ContentHash;
use super::sidecar::{Freshness, FreshnessPolicy, SidecarRecord};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File extensions recognised as model files (compared case-insensitively)
pub const MODEL_EXTENSIONS: [&str; 2] = ["safetensors", "safetensor"];

/// A model file found during a scan
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModelFile {
    /// Absolute, symlink-resolved location
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl ModelFile {
    /// `name.json` next to the model
    pub fn sidecar_path(&self) -> PathBuf {
        sidecar_path_for(&self.path)
    }

    /// File name for log lines and error messages
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

pub fn sidecar_path_for(model_path: &Path) -> PathBuf {
    model_path.with_extension("json")
}

pub fn is_model_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            MODEL_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Files split by whether a valid hash is cached in their sidecar
#[derive(Debug, Default, Clone)]
pub struct HashPartition {
    pub need_hash: Vec<ModelFile>,
    pub have_hash: Vec<ModelFile>,
}

/// Files split by metadata freshness
#[derive(Debug, Default, Clone)]
pub struct MetadataPartition {
    pub need_metadata: Vec<ModelFile>,
    pub fresh: Vec<ModelFile>,
}

/// Scanner rooted at one directory
#[derive(Debug, Clone)]
pub struct LocalScanner {
    root: PathBuf,
}

impl LocalScanner {
    /// Create a scanner, failing if `root` is missing or not a directory
    pub fn new(root: impl AsRef<Path>) -> SyncResult<Self> {
        let root = root.as_ref();
        if !root.exists() {
            return Err(SyncError::RootNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(SyncError::NotADirectory(root.to_path_buf()));
        }
        let root = root.canonicalize().map_err(|e| SyncError::io(root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Recursively find model files, deduplicated by resolved path and sorted
    pub fn discover(&self) -> SyncResult<Vec<ModelFile>> {
        let mut found: BTreeMap<PathBuf, u64> = BTreeMap::new();

        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    let io = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                    return Err(SyncError::io(&self.root, io));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if !entry.file_type().is_file() || !is_model_file(entry.path()) {
                continue;
            }

            let resolved = match entry.path().canonicalize() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(file = %entry.path().display(), error = %e, "Cannot resolve path");
                    continue;
                }
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            found.entry(resolved).or_insert(size);
        }

        tracing::info!(root = %self.root.display(), count = found.len(), "Discovered model files");

        Ok(found
            .into_iter()
            .map(|(path, size_bytes)| ModelFile { path, size_bytes })
            .collect())
    }

    /// Load a model's sidecar; unreadable or malformed records count as absent
    pub fn load_sidecar(model_path: &Path) -> Option<SidecarRecord> {
        let sidecar = sidecar_path_for(model_path);
        let content = match std::fs::read_to_string(&sidecar) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(sidecar = %sidecar.display(), error = %e, "Could not read sidecar");
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(sidecar = %sidecar.display(), error = %e, "Could not parse sidecar");
                None
            }
        }
    }

    pub fn classify_for_hashing(&self) -> SyncResult<HashPartition> {
        Ok(partition_by_hash(&self.discover()?))
    }

    pub fn classify_for_metadata(
        &self,
        policy: &FreshnessPolicy,
        now: DateTime<Utc>,
    ) -> SyncResult<MetadataPartition> {
        Ok(partition_by_freshness(&self.discover()?, policy, now))
    }

    pub fn all_known_hashes(&self) -> SyncResult<BTreeMap<PathBuf, ContentHash>> {
        Ok(known_hashes(&self.discover()?))
    }
}

pub fn partition_by_hash(files: &[ModelFile]) -> HashPartition {
    let mut partition = HashPartition::default();
    for file in files {
        let cached = LocalScanner::load_sidecar(&file.path).and_then(|r| r.hash());
        if cached.is_some() {
            partition.have_hash.push(file.clone());
        } else {
            partition.need_hash.push(file.clone());
        }
    }

    tracing::info!(
        need_hash = partition.need_hash.len(),
        have_hash = partition.have_hash.len(),
        "Hash analysis complete"
    );
    partition
}

pub fn partition_by_freshness(
    files: &[ModelFile],
    policy: &FreshnessPolicy,
    now: DateTime<Utc>,
) -> MetadataPartition {
    let mut partition = MetadataPartition::default();
    for file in files {
        let record = LocalScanner::load_sidecar(&file.path);
        match policy.classify(record.as_ref(), now) {
            Freshness::Fresh => partition.fresh.push(file.clone()),
            Freshness::Stale(reason) => {
                tracing::debug!(file = %file.name(), reason = %reason, "Metadata needs refresh");
                partition.need_metadata.push(file.clone());
            }
        }
    }

    tracing::info!(
        need_metadata = partition.need_metadata.len(),
        fresh = partition.fresh.len(),
        "Metadata analysis complete"
    );
    partition
}

pub fn known_hashes(files: &[ModelFile]) -> BTreeMap<PathBuf, ContentHash> {
    files
        .iter()
        .filter_map(|file| {
            LocalScanner::load_sidecar(&file.path)
                .and_then(|r| r.hash())
                .map(|hash| (file.path.clone(), hash))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sidecar::format_timestamp;
    use tempfile::TempDir;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"weights").unwrap();
    }

    #[test]
    fn test_new_rejects_missing_and_file_roots() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            LocalScanner::new(dir.path().join("nope")),
            Err(SyncError::RootNotFound(_))
        ));

        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            LocalScanner::new(&file),
            Err(SyncError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_discover_recursive_sorted_filtered() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("b.safetensors"));
        touch(&dir.path().join("a.SAFETENSORS"));
        touch(&dir.path().join("sub/c.safetensor"));
        touch(&dir.path().join("notes.txt"));
        touch(&dir.path().join("model.ckpt"));

        let scanner = LocalScanner::new(dir.path()).unwrap();
        let names: Vec<String> = scanner.discover().unwrap().iter().map(|f| f.name()).collect();

        assert_eq!(names, vec!["a.SAFETENSORS", "b.safetensors", "c.safetensor"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_discover_dedupes_symlinks() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real.safetensors");
        touch(&real);
        std::os::unix::fs::symlink(&real, dir.path().join("link.safetensors")).unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

        let scanner = LocalScanner::new(dir.path()).unwrap();
        let files = scanner.discover().unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, real.canonicalize().unwrap());
    }

    #[test]
    fn test_load_sidecar_treats_garbage_as_absent() {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("m.safetensors");
        touch(&model);
        assert!(LocalScanner::load_sidecar(&model).is_none());

        std::fs::write(dir.path().join("m.json"), "{ truncated").unwrap();
        assert!(LocalScanner::load_sidecar(&model).is_none());

        std::fs::write(dir.path().join("m.json"), "[1, 2]").unwrap();
        assert!(LocalScanner::load_sidecar(&model).is_none());
    }

    #[test]
    fn test_classify_for_hashing() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("cached.safetensors"));
        touch(&dir.path().join("fresh.safetensors"));
        touch(&dir.path().join("legacy.safetensors"));
        std::fs::write(
            dir.path().join("cached.json"),
            format!(r#"{{"sha256": "{}"}}"#, HASH),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("legacy.json"),
            format!(r#"{{"computed_hash": "{}"}}"#, HASH),
        )
        .unwrap();

        let scanner = LocalScanner::new(dir.path()).unwrap();
        let partition = scanner.classify_for_hashing().unwrap();

        let need: Vec<String> = partition.need_hash.iter().map(|f| f.name()).collect();
        let have: Vec<String> = partition.have_hash.iter().map(|f| f.name()).collect();
        assert_eq!(need, vec!["fresh.safetensors"]);
        assert_eq!(have, vec!["cached.safetensors", "legacy.safetensors"]);

        let hashes = scanner.all_known_hashes().unwrap();
        assert_eq!(hashes.len(), 2);
        assert!(hashes.values().all(|h| h.as_str() == HASH));
    }

    #[test]
    fn test_classify_for_metadata() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        touch(&dir.path().join("complete.safetensors"));
        touch(&dir.path().join("missing.safetensors"));
        touch(&dir.path().join("absent.safetensors"));
        std::fs::write(
            dir.path().join("complete.json"),
            format!(
                r#"{{"sha256": "{}", "model": {{}}, "modelId": 1, "modelVersionId": 2, "lastUpdated": "{}"}}"#,
                HASH,
                format_timestamp(now)
            ),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("absent.json"),
            format!(
                r#"{{"sha256": "{}", "notFoundOnRemote": true, "lastUpdated": "{}"}}"#,
                HASH,
                format_timestamp(now)
            ),
        )
        .unwrap();

        let scanner = LocalScanner::new(dir.path()).unwrap();
        let partition = scanner
            .classify_for_metadata(&FreshnessPolicy::new(30, false), now)
            .unwrap();
        let need: Vec<String> = partition.need_metadata.iter().map(|f| f.name()).collect();
        assert_eq!(need, vec!["missing.safetensors"]);
        assert_eq!(partition.fresh.len(), 2);

        let forced = scanner
            .classify_for_metadata(&FreshnessPolicy::new(30, true), now)
            .unwrap();
        assert_eq!(forced.need_metadata.len(), 3);
    }
}
