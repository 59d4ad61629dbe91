//! External collaborators of the pipeline.
//!
//! Each black-box service is a trait; the orchestrator only ever holds
//! `Arc<dyn Trait>` so tests can substitute deterministic fakes.
//!
//! | Trait | Production implementation |
//! |-------|---------------------------|
//! | [`IntentExtractor`] | [`openai::OpenAiExtractor`] (chat completions, JSON schema output) |
//! | [`ProductSearch`] | [`serpapi::SerpApiSearch`] (Google Shopping) |
//! | [`ImageMerger`] | [`gemini::GeminiMerger`] (`generateContent` with two images) |
//! | [`ObjectStorage`] | [`s3::S3Storage`] (SigV4) or [`fs::FsStorage`] (local directory) |

pub mod fs;
pub mod gemini;
pub mod openai;
pub mod s3;
pub mod serpapi;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::models::{Candidate, Message, ShoppingQuery};

/// Result of the shopping-intent gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentCheck {
    pub is_shopping_related: bool,
    /// Reply to send when the message is not about shopping.
    #[serde(default)]
    pub response_if_not_related: Option<String>,
}

impl IntentCheck {
    pub fn shopping() -> Self {
        Self {
            is_shopping_related: true,
            response_if_not_related: None,
        }
    }
}

#[async_trait]
pub trait IntentExtractor: Send + Sync {
    /// Decides whether the latest message is a shopping request at all.
    ///
    /// The default treats everything as shopping-related.
    async fn classify(&self, _messages: &[Message]) -> Result<IntentCheck> {
        Ok(IntentCheck::shopping())
    }

    /// Extracts a structured query from the conversation so far.
    ///
    /// Fields the user never mentioned must come back as `None`.
    async fn extract(&self, messages: &[Message]) -> Result<ShoppingQuery>;
}

#[async_trait]
pub trait ProductSearch: Send + Sync {
    async fn search(&self, query: &ShoppingQuery) -> Result<Vec<Candidate>>;
}

/// Encoded image plus its MIME type.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageBytes {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// File extension for the MIME type, used when naming stored objects.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

#[async_trait]
pub trait ImageMerger: Send + Sync {
    /// Composites the product shown at `product_image_url` onto `person`.
    async fn merge(
        &self,
        person: &ImageBytes,
        product_image_url: &str,
        prompt: &str,
    ) -> Result<ImageBytes>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under the caller-chosen `key` and returns the key.
    async fn upload(&self, bytes: &[u8], key: &str, content_type: &str) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// A URL granting temporary read access to `key`.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Guesses an image MIME type from a key or file name.
pub fn mime_from_key(key: &str) -> &'static str {
    match key.rsplit('.').next().map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

/// Production collaborators built from config.
pub struct Providers {
    pub extractor: Arc<dyn IntentExtractor>,
    pub search: Arc<dyn ProductSearch>,
    pub merger: Arc<dyn ImageMerger>,
    pub storage: Arc<dyn ObjectStorage>,
}

/// Instantiates every collaborator named in `config`.
///
/// # Errors
///
/// Fails when a required API key is missing from the environment
/// (`OPENAI_API_KEY`, `SERPAPI_API_KEY`, `GEMINI_API_KEY`) or the storage
/// backend cannot be configured.
pub fn create_providers(config: &Config) -> Result<Providers> {
    Ok(Providers {
        extractor: Arc::new(openai::OpenAiExtractor::new(&config.extraction)?),
        search: Arc::new(serpapi::SerpApiSearch::new(&config.search)?),
        merger: Arc::new(gemini::GeminiMerger::new(&config.image_merge)?),
        storage: create_storage(config)?,
    })
}

pub fn create_storage(config: &Config) -> Result<Arc<dyn ObjectStorage>> {
    match config.storage.backend.as_str() {
        "fs" => Ok(Arc::new(fs::FsStorage::new(config.storage.root.clone()))),
        "s3" => Ok(Arc::new(s3::S3Storage::from_config(&config.storage)?)),
        other => bail!("Unknown storage backend: {}", other),
    }
}

/// Sends a JSON request built by `build`, retrying transient failures.
///
/// - HTTP 429 and 5xx → retry
/// - other 4xx → fail immediately
/// - network errors → retry
/// - backoff 1s, 2s, 4s, ... capped at 32s
pub(crate) async fn send_json_with_retry<F>(
    label: &str,
    max_retries: u32,
    build: F,
) -> Result<serde_json::Value>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                let snippet: String = body_text.chars().take(500).collect();
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::debug!(%label, %status, attempt, "transient API error, retrying");
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", label, status, snippet));
                    continue;
                }

                bail!("{} API error {}: {}", label, status, snippet);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} request failed: {}", label, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} failed after retries", label)))
}

/// Reads a non-empty environment variable.
pub(crate) fn env_key(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_detection() {
        assert_eq!(mime_from_key("photos/u1/a.JPG"), "image/jpeg");
        assert_eq!(mime_from_key("x.webp"), "image/webp");
        assert_eq!(mime_from_key("composites/t/abc"), "image/png");
    }

    #[test]
    fn extension_follows_mime() {
        assert_eq!(ImageBytes::new(vec![], "image/jpeg").extension(), "jpg");
        assert_eq!(ImageBytes::new(vec![], "image/png").extension(), "png");
    }
}
