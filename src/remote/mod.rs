//! Remote model catalog access
//!
//! The catalog answers "which model version has this content hash" and serves
//! the preview images listed in that answer. All access goes through
//! [`RemoteCatalog`] so the reconciliation engine can run against the HTTP
//! client or an in-memory script.

pub mod client;
pub mod media;
pub mod retry;

pub use client::HttpCatalogClient;
pub use retry::{RateLimiter, RetryPolicy};

use crate::models::ContentHash;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::{Path, PathBuf};

// ============================================================================
// Catalog Data
// ============================================================================

/// Image entry attached to a model or model version
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteImage {
    #[serde(default)]
    pub url: Option<String>,

    /// `image` or `video`
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl RemoteImage {
    pub fn is_video(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|k| k.eq_ignore_ascii_case("video"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteModel {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub nsfw: Option<bool>,

    #[serde(default)]
    pub poi: Option<bool>,

    #[serde(default, deserialize_with = "lenient_images")]
    pub images: Vec<RemoteImage>,
}

/// Model version returned by a by-hash lookup
///
/// Deserialized leniently: missing or null fields become empty values and
/// malformed image entries are dropped instead of failing the lookup.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelVersion {
    #[serde(default)]
    pub id: Option<u64>,

    #[serde(rename = "modelId", default)]
    pub model_id: Option<u64>,

    #[serde(default)]
    pub model: Option<RemoteModel>,

    #[serde(rename = "trainedWords", default, deserialize_with = "lenient_strings")]
    pub trained_words: Vec<String>,

    #[serde(rename = "baseModel", default)]
    pub base_model: Option<String>,

    #[serde(default, deserialize_with = "lenient_images")]
    pub images: Vec<RemoteImage>,
}

fn lenient_images<'de, D>(deserializer: D) -> Result<Vec<RemoteImage>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            _ => None,
        })
        .collect())
}

/// Outcome of a by-hash lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(ModelVersion),
    /// The catalog has no record for the hash; a valid terminal answer
    NotFound,
}

// ============================================================================
// Errors
// ============================================================================

/// Failures talking to the catalog
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Request failed after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },

    #[error("Server error {status} after {attempts} attempts")]
    ServerError { status: u16, attempts: u32 },

    /// Non-retryable status such as 401 or 403
    #[error("Unexpected HTTP status {status}")]
    Status { status: u16 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RemoteError::Io {
            path: path.into(),
            source,
        }
    }
}

// ============================================================================
// Trait Definitions
// ============================================================================

/// Catalog operations used by the reconciliation engine
///
/// Implementations own their rate limiting and retry policy; callers see
/// only the final outcome of each operation.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Look up the model version whose file has `hash`
    async fn lookup_by_hash(&self, hash: &ContentHash) -> Result<Lookup, RemoteError>;

    /// First listed URL that actually serves an image
    async fn primary_image_url(&self, version: &ModelVersion) -> Option<String>;

    /// Download `url` to `<destination_stem>.preview.<ext>`
    ///
    /// Returns the path written. Nothing is left at the final path unless the
    /// download completed.
    async fn download_image(
        &self,
        url: &str,
        destination_stem: &Path,
    ) -> Result<PathBuf, RemoteError>;
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::models::preview::{preview_path, remove_superseded};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Scripted answer for one hash
    #[derive(Debug, Clone)]
    pub enum ScriptedLookup {
        Found(ModelVersion),
        NotFound,
        Fail,
    }

    /// In-memory catalog with call counters
    ///
    /// Unscripted hashes answer `NotFound`.
    #[derive(Default)]
    pub struct ScriptedCatalog {
        lookups: Mutex<HashMap<String, ScriptedLookup>>,
        fail_downloads: Mutex<bool>,
        interrupt_after: Mutex<Option<(usize, Arc<AtomicBool>)>>,
        pub lookup_calls: AtomicUsize,
        pub image_url_calls: AtomicUsize,
        pub download_calls: AtomicUsize,
    }

    impl ScriptedCatalog {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, hash: &ContentHash, answer: ScriptedLookup) {
            self.lookups
                .lock()
                .unwrap()
                .insert(hash.as_str().to_string(), answer);
        }

        pub fn fail_downloads(&self) {
            *self.fail_downloads.lock().unwrap() = true;
        }

        /// Raise `flag` once `lookups` lookups have been answered
        pub fn interrupt_after(&self, lookups: usize, flag: Arc<AtomicBool>) {
            *self.interrupt_after.lock().unwrap() = Some((lookups, flag));
        }

        pub fn lookups(&self) -> usize {
            self.lookup_calls.load(Ordering::SeqCst)
        }

        pub fn downloads(&self) -> usize {
            self.download_calls.load(Ordering::SeqCst)
        }

        /// Total calls of every kind
        pub fn network_calls(&self) -> usize {
            self.lookups()
                + self.image_url_calls.load(Ordering::SeqCst)
                + self.downloads()
        }
    }

    #[async_trait]
    impl RemoteCatalog for ScriptedCatalog {
        async fn lookup_by_hash(&self, hash: &ContentHash) -> Result<Lookup, RemoteError> {
            let calls = self.lookup_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, flag)) = self.interrupt_after.lock().unwrap().as_ref()
                && calls >= *after
            {
                flag.store(true, Ordering::SeqCst);
            }
            let answer = self.lookups.lock().unwrap().get(hash.as_str()).cloned();
            match answer {
                Some(ScriptedLookup::Found(version)) => Ok(Lookup::Found(version)),
                Some(ScriptedLookup::Fail) => Err(RemoteError::Timeout { attempts: 4 }),
                Some(ScriptedLookup::NotFound) | None => Ok(Lookup::NotFound),
            }
        }

        async fn primary_image_url(&self, version: &ModelVersion) -> Option<String> {
            self.image_url_calls.fetch_add(1, Ordering::SeqCst);
            media::candidate_urls(version).into_iter().next()
        }

        async fn download_image(
            &self,
            url: &str,
            destination_stem: &Path,
        ) -> Result<PathBuf, RemoteError> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail_downloads.lock().unwrap() {
                return Err(RemoteError::Transport {
                    attempts: 4,
                    message: format!("connection reset fetching {}", url),
                });
            }
            let dest = preview_path(destination_stem, "png");
            std::fs::write(&dest, b"\x89PNG\r\n\x1a\nmock").map_err(|e| RemoteError::io(&dest, e))?;
            remove_superseded(destination_stem, &dest);
            Ok(dest)
        }
    }
}
