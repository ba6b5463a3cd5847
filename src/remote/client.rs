//! HTTP catalog client
//!
//! Every request, including retries and the probes used to check image URLs,
//! first waits on the shared [`RateLimiter`]. Rate limiting (429), timeouts,
//! transport failures and 5xx answers are retried with exponential backoff;
//! 404 is a terminal answer and any other status fails immediately.

use super::media::{self, MediaKind, SNIFF_BYTES};
use super::retry::{RateLimiter, RetryCause, RetryPolicy};
use super::{Lookup, ModelVersion, RemoteCatalog, RemoteError};
use crate::config::SyncConfig;
use crate::models::ContentHash;
use crate::models::preview::{extension_for_media_type, preview_path, remove_superseded};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RANGE};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Catalog client over HTTP
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl HttpCatalogClient {
    /// Build a client from configuration
    ///
    /// The API key, when present, is sent as a bearer token on every request.
    pub fn new(config: &SyncConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        match config.api_key() {
            Some(key) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
                    .context("API key contains characters not allowed in a header")?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            None => tracing::warn!("No API key configured, using unauthenticated requests"),
        }

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(config.rate_limit_delay()),
            retry: config.retry_policy(),
        })
    }

    fn lookup_url(&self, hash: &ContentHash) -> String {
        format!("{}/model-versions/by-hash/{}", self.base_url, hash)
    }

    /// Send a request built by `build`, retrying transient failures
    ///
    /// Returns the first response that is not 429 or 5xx; the caller decides
    /// what its status means.
    async fn send_with_retry<F>(&self, what: &str, build: F) -> Result<reqwest::Response, RemoteError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let attempts = self.retry.attempts();
        let mut attempt: u32 = 0;

        loop {
            self.limiter.acquire().await;

            let cause = match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        RetryCause::RateLimited
                    } else if status.is_server_error() {
                        RetryCause::Server(status.as_u16())
                    } else {
                        return Ok(response);
                    }
                }
                Err(e) if e.is_timeout() => RetryCause::Timeout,
                Err(e) => RetryCause::Transport(e.to_string()),
            };

            attempt += 1;
            if attempt >= attempts {
                tracing::error!(request = %what, attempts, cause = %cause, "Giving up after retries");
                return Err(cause.into_error(attempts));
            }

            let delay = self.retry.next_delay(attempt - 1);
            tracing::warn!(
                request = %what,
                attempt,
                delay_ms = delay.as_millis() as u64,
                cause = %cause,
                "Request failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Check whether `url` serves an image
    ///
    /// Uses the declared content type from a HEAD request, falling back to a
    /// ranged GET and a look at the first bytes when the type is generic.
    async fn serves_image(&self, url: &str) -> Result<bool, RemoteError> {
        let head = self.send_with_retry(url, || self.client.head(url)).await?;
        let status = head.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(false);
        }
        let declared = if status.is_success() {
            media::classify_content_type(content_type(head.headers()).as_deref())
        } else {
            MediaKind::Unknown
        };

        match declared {
            MediaKind::Image => return Ok(true),
            MediaKind::NotImage => return Ok(false),
            MediaKind::Unknown => {}
        }

        let range = format!("bytes=0-{}", SNIFF_BYTES - 1);
        let mut response = self
            .send_with_retry(url, || self.client.get(url).header(RANGE, range.as_str()))
            .await?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
            });
        }
        match media::classify_content_type(content_type(response.headers()).as_deref()) {
            MediaKind::Image => return Ok(true),
            MediaKind::NotImage => return Ok(false),
            MediaKind::Unknown => {}
        }

        let mut prefix: Vec<u8> = Vec::with_capacity(SNIFF_BYTES);
        while prefix.len() < SNIFF_BYTES {
            match response.chunk().await.map_err(transfer_error)? {
                Some(chunk) => prefix.extend_from_slice(&chunk),
                None => break,
            }
        }
        Ok(media::sniff_image(&prefix).is_some())
    }
}

#[async_trait]
impl RemoteCatalog for HttpCatalogClient {
    async fn lookup_by_hash(&self, hash: &ContentHash) -> Result<Lookup, RemoteError> {
        let url = self.lookup_url(hash);
        tracing::info!(hash = %hash.short(), "Fetching metadata");

        let response = self
            .send_with_retry(&url, || self.client.get(url.as_str()))
            .await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            tracing::info!(hash = %hash.short(), "Model not found on remote");
            return Ok(Lookup::NotFound);
        }
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
            });
        }

        let version: ModelVersion = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        tracing::debug!(
            hash = %hash.short(),
            model_version_id = ?version.id,
            "Metadata fetched"
        );
        Ok(Lookup::Found(version))
    }

    async fn primary_image_url(&self, version: &ModelVersion) -> Option<String> {
        for url in media::candidate_urls(version) {
            match self.serves_image(&url).await {
                Ok(true) => return Some(url),
                Ok(false) => tracing::debug!(url = %url, "Not an image, trying next entry"),
                Err(e) => tracing::warn!(url = %url, error = %e, "Could not inspect image URL"),
            }
        }
        None
    }

    async fn download_image(
        &self,
        url: &str,
        destination_stem: &Path,
    ) -> Result<PathBuf, RemoteError> {
        tracing::info!(url = %url, "Downloading preview image");

        let mut response = self.send_with_retry(url, || self.client.get(url)).await?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
            });
        }

        let declared = content_type(response.headers());
        let first = response.chunk().await.map_err(transfer_error)?;
        let Some(first) = first else {
            return Err(RemoteError::InvalidResponse("empty image body".to_string()));
        };

        let media_type = match media::classify_content_type(declared.as_deref()) {
            MediaKind::Image => declared,
            _ => media::sniff_image(&first)
                .map(str::to_string)
                .or(declared),
        };
        let destination = preview_path(destination_stem, extension_for_media_type(media_type.as_deref()));

        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::io(parent, e))?;
        }

        // Stream into a sibling and rename once complete
        let partial = partial_path_for(&destination);
        let written: Result<u64, RemoteError> = async {
            let mut file = fs::File::create(&partial)
                .await
                .map_err(|e| RemoteError::io(&partial, e))?;
            let mut total: u64 = 0;
            let mut next = Some(first);
            while let Some(chunk) = next {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| RemoteError::io(&partial, e))?;
                total += chunk.len() as u64;
                next = response.chunk().await.map_err(transfer_error)?;
            }
            file.sync_all()
                .await
                .map_err(|e| RemoteError::io(&partial, e))?;
            fs::rename(&partial, &destination)
                .await
                .map_err(|e| RemoteError::io(&destination, e))?;
            Ok(total)
        }
        .await;

        match written {
            Ok(bytes) => {
                remove_superseded(destination_stem, &destination);
                tracing::info!(preview = %destination.display(), bytes, "Preview image saved");
                Ok(destination)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Failure while reading a body that already started arriving
fn transfer_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout { attempts: 1 }
    } else {
        RemoteError::Transport {
            attempts: 1,
            message: e.to_string(),
        }
    }
}

/// `name.preview.png` -> `name.preview.png.part`
pub fn partial_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}
