//! Picking an image out of the catalog's media list
//!
//! Catalog entries mix stills and videos, sometimes videos first, and the
//! declared `type` is not always present. A URL is only used as a preview
//! once the served content has been confirmed to be an image.

use super::ModelVersion;

/// Video URL extensions
pub const VIDEO_EXTENSIONS: [&str; 8] = ["mp4", "webm", "mov", "avi", "mkv", "m4v", "wmv", "flv"];

/// Other URL extensions that never serve an image
pub const NON_IMAGE_EXTENSIONS: [&str; 10] = [
    "html", "htm", "json", "txt", "xml", "zip", "pdf", "js", "safetensors", "ckpt",
];

/// Bytes fetched when the content type has to be sniffed
pub const SNIFF_BYTES: usize = 32;

/// Lowercased extension of the URL's last path segment
pub fn url_extension(url: &str) -> Option<String> {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Video or another extension known not to be an image
pub fn has_non_image_extension(url: &str) -> bool {
    url_extension(url).is_some_and(|ext| {
        VIDEO_EXTENSIONS.contains(&ext.as_str()) || NON_IMAGE_EXTENSIONS.contains(&ext.as_str())
    })
}

/// Image URLs worth inspecting, in listing order
///
/// Version images come first, then model images. Entries typed as video or
/// carrying a non-image extension are skipped, duplicates are dropped.
pub fn candidate_urls(version: &ModelVersion) -> Vec<String> {
    let model_images = version
        .model
        .as_ref()
        .map(|m| m.images.as_slice())
        .unwrap_or_default();

    let mut urls: Vec<String> = Vec::new();
    for image in version.images.iter().chain(model_images) {
        let Some(url) = image.url.as_deref().map(str::trim) else {
            continue;
        };
        if url.is_empty() || image.is_video() || has_non_image_extension(url) {
            tracing::debug!(url = %url, "Skipping non-image media entry");
            continue;
        }
        if !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

/// What a declared content type says about a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    NotImage,
    /// Missing or generic; the body has to be checked
    Unknown,
}

pub fn classify_content_type(content_type: Option<&str>) -> MediaKind {
    let Some(content_type) = content_type else {
        return MediaKind::Unknown;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if essence.is_empty()
        || essence == "application/octet-stream"
        || essence == "binary/octet-stream"
    {
        MediaKind::Unknown
    } else if essence.starts_with("image/") {
        MediaKind::Image
    } else {
        MediaKind::NotImage
    }
}

/// Media type of an image recognised by its leading bytes
pub fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"BM") {
        Some("image/bmp")
    } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        Some("image/tiff")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteImage, RemoteModel};

    fn image(url: &str, kind: Option<&str>) -> RemoteImage {
        RemoteImage {
            url: Some(url.to_string()),
            kind: kind.map(str::to_string),
        }
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(
            url_extension("https://cdn.example/a/b/clip.MP4?token=1").as_deref(),
            Some("mp4")
        );
        assert_eq!(
            url_extension("https://cdn.example/width=450/123.jpeg").as_deref(),
            Some("jpeg")
        );
        assert_eq!(url_extension("https://cdn.example/a/noext"), None);
        assert_eq!(url_extension("relative/file.webm#t=1").as_deref(), Some("webm"));
    }

    #[test]
    fn test_candidate_urls_skip_videos_in_order() {
        let version = ModelVersion {
            images: vec![
                image("https://cdn/1.mp4", None),
                image("https://cdn/2", Some("video")),
                image("https://cdn/3.jpeg", Some("image")),
                RemoteImage::default(),
            ],
            model: Some(RemoteModel {
                images: vec![
                    image("https://cdn/3.jpeg", None),
                    image("https://cdn/4.png", None),
                ],
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(
            candidate_urls(&version),
            vec!["https://cdn/3.jpeg", "https://cdn/4.png"]
        );
    }

    #[test]
    fn test_candidate_urls_skip_non_image_extensions() {
        let version = ModelVersion {
            images: vec![
                image("https://cdn/readme.html", None),
                image("https://cdn/meta.JSON?x=1", None),
                image("https://cdn/notes.txt", Some("image")),
                image("https://cdn/bundle.zip", None),
                image("https://cdn/cover.webp", None),
                image("https://cdn/no-extension", None),
            ],
            ..Default::default()
        };

        assert_eq!(
            candidate_urls(&version),
            vec!["https://cdn/cover.webp", "https://cdn/no-extension"]
        );
        assert!(has_non_image_extension("https://cdn/clip.mp4"));
        assert!(!has_non_image_extension("https://cdn/photo.jpeg"));
    }

    #[test]
    fn test_candidate_urls_empty() {
        assert!(candidate_urls(&ModelVersion::default()).is_empty());
    }

    #[test]
    fn test_classify_content_type() {
        assert_eq!(classify_content_type(Some("image/jpeg")), MediaKind::Image);
        assert_eq!(
            classify_content_type(Some("Image/WebP; q=1")),
            MediaKind::Image
        );
        assert_eq!(classify_content_type(Some("video/mp4")), MediaKind::NotImage);
        assert_eq!(classify_content_type(Some("text/html")), MediaKind::NotImage);
        assert_eq!(
            classify_content_type(Some("application/octet-stream")),
            MediaKind::Unknown
        );
        assert_eq!(classify_content_type(None), MediaKind::Unknown);
    }

    #[test]
    fn test_sniff_image() {
        assert_eq!(sniff_image(b"\x89PNG\r\n\x1a\n...."), Some("image/png"));
        assert_eq!(sniff_image(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_image(b"GIF89a..."), Some("image/gif"));
        assert_eq!(sniff_image(b"RIFF\x10\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_image(b"RIFF\x10\0\0\0AVI LIST"), None);
        assert_eq!(sniff_image(b"II*\0rest"), Some("image/tiff"));
        assert_eq!(sniff_image(b"\0\0\0\x18ftypmp42"), None);
        assert_eq!(sniff_image(b""), None);
    }
}
