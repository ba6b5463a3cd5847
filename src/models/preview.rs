//! Preview image naming
//!
//! A model `dir/name.safetensors` owns at most one preview
//! `dir/name.preview.<ext>`. The extension follows the media type the image
//! was served with; any preview with a different extension is superseded
//! when a new one is saved.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Extensions recognised as preview images
pub const PREVIEW_EXTENSIONS: [&str; 8] = ["png", "jpg", "jpeg", "webp", "gif", "bmp", "tiff", "tif"];

/// Extension used when the media type is missing or unrecognised
pub const DEFAULT_PREVIEW_EXTENSION: &str = "png";

/// Map a declared media type to a preview extension
pub fn extension_for_media_type(media_type: Option<&str>) -> &'static str {
    let Some(media_type) = media_type else {
        return DEFAULT_PREVIEW_EXTENSION;
    };
    let essence = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match essence.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" | "image/x-ms-bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => DEFAULT_PREVIEW_EXTENSION,
    }
}

/// Model path with its extension removed: `dir/name.safetensors` -> `dir/name`
pub fn model_stem(model_path: &Path) -> PathBuf {
    model_path.with_extension("")
}

/// `stem.preview.<ext>`
pub fn preview_path(stem: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(stem.as_os_str());
    name.push(".preview.");
    name.push(extension);
    PathBuf::from(name)
}

/// All existing previews for a model stem, in [`PREVIEW_EXTENSIONS`] order
pub fn existing_previews(stem: &Path) -> Vec<PathBuf> {
    PREVIEW_EXTENSIONS
        .iter()
        .map(|ext| preview_path(stem, ext))
        .filter(|p| p.is_file())
        .collect()
}

pub fn has_preview(model_path: &Path) -> bool {
    !existing_previews(&model_stem(model_path)).is_empty()
}

/// Remove previews for `stem` other than `keep`, returning how many were removed
pub fn remove_superseded(stem: &Path, keep: &Path) -> usize {
    let mut removed = 0;
    for old in existing_previews(stem) {
        if old == keep {
            continue;
        }
        match std::fs::remove_file(&old) {
            Ok(()) => {
                tracing::debug!(preview = %old.display(), "Removed superseded preview");
                removed += 1;
            }
            Err(e) => {
                tracing::warn!(preview = %old.display(), error = %e, "Failed to remove old preview")
            }
        }
    }
    removed
}

/// Split `name.preview.<ext>` into `name` when `<ext>` is a preview extension
pub fn preview_owner_stem(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?.to_str()?;
    let (base, ext) = file_name.rsplit_once('.')?;
    if !PREVIEW_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        return None;
    }
    let base = base.strip_suffix(".preview")?;
    if base.is_empty() {
        return None;
    }
    Some(path.with_file_name(base))
}
