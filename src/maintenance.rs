//! Offline housekeeping over a model folder
//!
//! Nothing here talks to the catalog.

use crate::error::{SyncError, SyncResult};
use crate::models::preview::{has_preview, model_stem, preview_owner_stem};
use crate::models::scanner::is_model_file;
use crate::models::sidecar::HASH_KEYS;
use crate::models::{LocalScanner, ModelFile};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Keys that mark a not-found record, current and legacy
const NOT_FOUND_KEYS: [&str; 2] = ["notFoundOnRemote", "civitai_not_found"];

/// Model files whose sidecar says the catalog does not know them
pub fn list_not_found(scanner: &LocalScanner) -> SyncResult<Vec<ModelFile>> {
    Ok(scanner
        .discover()?
        .into_iter()
        .filter(|file| {
            LocalScanner::load_sidecar(&file.path).is_some_and(|record| record.is_not_found())
        })
        .collect())
}

/// Model files without a preview image of any recognised extension
pub fn list_missing_previews(scanner: &LocalScanner) -> SyncResult<Vec<ModelFile>> {
    Ok(scanner
        .discover()?
        .into_iter()
        .filter(|file| !has_preview(&file.path))
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sidecars_removed: Vec<PathBuf>,
    pub previews_removed: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn total_removed(&self) -> usize {
        self.sidecars_removed.len() + self.previews_removed.len()
    }
}

/// A JSON object carrying a hash key or the not-found flag
pub fn looks_like_sidecar(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&content) else {
        return false;
    };
    HASH_KEYS
        .iter()
        .chain(NOT_FOUND_KEYS.iter())
        .any(|key| object.contains_key(*key))
}

/// Delete sidecars and previews whose model file is gone
///
/// Symlinks are not followed, so nothing outside the folder is touched.
pub fn cleanup_orphans(scanner: &LocalScanner) -> SyncResult<CleanupReport> {
    let mut model_stems: BTreeSet<PathBuf> = BTreeSet::new();
    let mut sidecars: Vec<PathBuf> = Vec::new();
    let mut previews: Vec<(PathBuf, PathBuf)> = Vec::new();

    for entry in WalkDir::new(scanner.root()).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                let io = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                return Err(SyncError::io(scanner.root(), io));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();
        if is_model_file(&path) {
            model_stems.insert(model_stem(&path));
        } else if let Some(owner) = preview_owner_stem(&path) {
            previews.push((path, owner));
        } else if path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("json"))
        {
            sidecars.push(path);
        }
    }

    let mut report = CleanupReport::default();

    for sidecar in sidecars {
        if model_stems.contains(&sidecar.with_extension("")) || !looks_like_sidecar(&sidecar) {
            continue;
        }
        match std::fs::remove_file(&sidecar) {
            Ok(()) => {
                tracing::info!(sidecar = %sidecar.display(), "Removed orphaned sidecar");
                report.sidecars_removed.push(sidecar);
            }
            Err(e) => report
                .errors
                .push(format!("{}: {}", sidecar.display(), e)),
        }
    }

    for (preview, owner) in previews {
        if model_stems.contains(&owner) {
            continue;
        }
        match std::fs::remove_file(&preview) {
            Ok(()) => {
                tracing::info!(preview = %preview.display(), "Removed orphaned preview");
                report.previews_removed.push(preview);
            }
            Err(e) => report
                .errors
                .push(format!("{}: {}", preview.display(), e)),
        }
    }

    tracing::info!(
        sidecars = report.sidecars_removed.len(),
        previews = report.previews_removed.len(),
        errors = report.errors.len(),
        "Cleanup finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_list_not_found() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("a.safetensors"), "x");
        write(&dir.path().join("b.safetensors"), "x");
        write(&dir.path().join("c.safetensors"), "x");
        write(
            &dir.path().join("a.json"),
            &format!(r#"{{"sha256": "{}", "notFoundOnRemote": true}}"#, HASH),
        );
        write(
            &dir.path().join("c.json"),
            &format!(r#"{{"sha256": "{}", "civitai_not_found": true}}"#, HASH),
        );

        let scanner = LocalScanner::new(dir.path()).unwrap();
        let names: Vec<String> = list_not_found(&scanner)
            .unwrap()
            .iter()
            .map(|f| f.name())
            .collect();
        assert_eq!(names, vec!["a.safetensors", "c.safetensors"]);
    }

    #[test]
    fn test_list_missing_previews() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("a.safetensors"), "x");
        write(&dir.path().join("b.safetensors"), "x");
        write(&dir.path().join("a.preview.webp"), "img");

        let scanner = LocalScanner::new(dir.path()).unwrap();
        let names: Vec<String> = list_missing_previews(&scanner)
            .unwrap()
            .iter()
            .map(|f| f.name())
            .collect();
        assert_eq!(names, vec!["b.safetensors"]);
    }

    #[test]
    fn test_looks_like_sidecar() {
        let dir = TempDir::new().unwrap();
        let hashed = dir.path().join("h.json");
        let flagged = dir.path().join("f.json");
        let other = dir.path().join("o.json");
        let broken = dir.path().join("b.json");
        write(&hashed, &format!(r#"{{"computed_hash": "{}"}}"#, HASH));
        write(&flagged, r#"{"civitai_not_found": true}"#);
        write(&other, r#"{"name": "settings"}"#);
        write(&broken, "{");

        assert!(looks_like_sidecar(&hashed));
        assert!(looks_like_sidecar(&flagged));
        assert!(!looks_like_sidecar(&other));
        assert!(!looks_like_sidecar(&broken));
    }

    #[test]
    fn test_cleanup_orphans() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let record = format!(r#"{{"sha256": "{}"}}"#, HASH);

        write(&root.join("kept.safetensors"), "x");
        write(&root.join("kept.json"), &record);
        write(&root.join("kept.preview.png"), "img");
        write(&root.join("sub/gone.json"), &record);
        write(&root.join("sub/gone.preview.jpg"), "img");
        write(&root.join("sub/config.json"), r#"{"theme": "dark"}"#);
        write(&root.join("sub/notes.txt"), "hello");

        let scanner = LocalScanner::new(root).unwrap();
        let report = cleanup_orphans(&scanner).unwrap();

        assert_eq!(report.sidecars_removed.len(), 1);
        assert_eq!(report.previews_removed.len(), 1);
        assert_eq!(report.total_removed(), 2);
        assert!(report.errors.is_empty());

        assert!(root.join("kept.json").exists());
        assert!(root.join("kept.preview.png").exists());
        assert!(!root.join("sub/gone.json").exists());
        assert!(!root.join("sub/gone.preview.jpg").exists());
        assert!(root.join("sub/config.json").exists());
        assert!(root.join("sub/notes.txt").exists());
    }

    #[test]
    fn test_cleanup_matches_alternate_model_extension() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("alt.safetensor"), "x");
        write(
            &dir.path().join("alt.json"),
            &format!(r#"{{"sha256": "{}"}}"#, HASH),
        );

        let scanner = LocalScanner::new(dir.path()).unwrap();
        let report = cleanup_orphans(&scanner).unwrap();
        assert_eq!(report.total_removed(), 0);
        assert!(dir.path().join("alt.json").exists());
    }
}
