//! Image embedding providers and the infallible [`EmbeddingGenerator`].
//!
//! Defines the [`VisualEmbedder`] trait and concrete implementations:
//! - **[`DisabledEmbedder`]**: always errors; every visual embedding becomes a zero vector.
//! - **[`HttpEmbedder`]**: posts base64 images to a CLIP-style embedding service with retry and backoff.
//! - **`LocalEmbedder`**: runs an image model in-process via fastembed
//!   (feature `local-embeddings-fastembed`).
//!
//! The pipeline never talks to a provider directly. It goes through
//! [`EmbeddingGenerator`], which enforces the output contract:
//!
//! | Call | Output | On failure |
//! |------|--------|------------|
//! | [`EmbeddingGenerator::visual`] | unit-L2, `visual_dims` | zero vector of `visual_dims` |
//! | [`EmbeddingGenerator::color`] | unit-L2, `color_dims` | zero vector of `color_dims` |
//!
//! # Retry Strategy
//!
//! The HTTP provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

pub mod color;

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::similarity::l2_normalize;

pub use color::color_histogram;

/// A model that turns an encoded image into a vector.
#[async_trait]
pub trait VisualEmbedder: Send + Sync {
    /// Returns the model identifier.
    fn model_name(&self) -> &str;

    /// Embeds one encoded image (PNG, JPEG, WebP).
    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>>;
}

// ============ Generator ============

/// Produces fixed-size, unit-length embeddings and never fails.
///
/// Any provider error, timeout, or wrong-length output is logged and
/// replaced with a zero vector, which every similarity treats as neutral.
#[derive(Clone)]
pub struct EmbeddingGenerator {
    embedder: Arc<dyn VisualEmbedder>,
    visual_dims: usize,
    color_dims: usize,
    timeout: Duration,
}

impl EmbeddingGenerator {
    pub fn new(
        embedder: Arc<dyn VisualEmbedder>,
        visual_dims: usize,
        color_dims: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            visual_dims,
            color_dims,
            timeout,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self::new(
            create_embedder(config)?,
            config.visual_dims,
            config.color_dims,
            Duration::from_secs(config.timeout_secs),
        ))
    }

    pub fn visual_dims(&self) -> usize {
        self.visual_dims
    }

    pub fn color_dims(&self) -> usize {
        self.color_dims
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Visual embedding of `bytes`, or zeros if anything goes wrong.
    pub async fn visual(&self, bytes: &[u8]) -> Vec<f32> {
        match self.try_visual(bytes).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    model = self.embedder.model_name(),
                    error = %e,
                    "visual embedding failed, using zero vector"
                );
                vec![0.0; self.visual_dims]
            }
        }
    }

    async fn try_visual(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.is_empty() {
            bail!("empty image");
        }
        let mut v = match tokio::time::timeout(self.timeout, self.embedder.embed_image(bytes)).await
        {
            Ok(result) => result?,
            Err(_) => bail!("embedding timed out after {}s", self.timeout.as_secs()),
        };
        if v.len() != self.visual_dims {
            bail!(
                "model returned {} dims, expected {}",
                v.len(),
                self.visual_dims
            );
        }
        if v.iter().any(|x| !x.is_finite()) {
            bail!("model returned non-finite values");
        }
        l2_normalize(&mut v);
        Ok(v)
    }

    /// Color histogram embedding of `bytes`, or zeros if it cannot be decoded.
    pub fn color(&self, bytes: &[u8]) -> Vec<f32> {
        match color_histogram(bytes, self.color_dims) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "color histogram failed, using zero vector");
                vec![0.0; self.color_dims]
            }
        }
    }
}

// ============ Disabled Provider ============

/// Used when `embedding.provider = "disabled"`. Every call fails, so the
/// generator yields zero vectors and ranking degrades to input order.
pub struct DisabledEmbedder;

#[async_trait]
impl VisualEmbedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn embed_image(&self, _bytes: &[u8]) -> Result<Vec<f32>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ HTTP Provider ============

/// Calls a remote image embedding service.
///
/// Request body:
///
/// ```json
/// { "model": "clip-vit-large-patch14", "input": ["<base64 image>"] }
/// ```
///
/// Accepted response shapes: OpenAI-style `{"data":[{"embedding":[...]}]}`,
/// `{"embeddings":[[...]]}` or `{"embedding":[...]}`.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl HttpEmbedder {
    /// Reads an optional bearer token from `EMBEDDING_API_KEY`.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.url required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "clip-vit-large-patch14".to_string()),
            api_key: std::env::var("EMBEDDING_API_KEY").ok(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl VisualEmbedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [BASE64.encode(bytes)],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", key));
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embedding_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!(
                            "Embedding API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    bail!("Embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

/// Pulls the first vector out of any of the accepted response shapes.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let array = json
        .get("data")
        .and_then(|d| d.get(0))
        .and_then(|item| item.get("embedding"))
        .or_else(|| json.get("embeddings").and_then(|e| e.get(0)))
        .or_else(|| json.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: no vector found"))?;

    array
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: non-numeric value"))
        })
        .collect()
}

// ============ Local Provider (fastembed) ============

/// Runs an image embedding model in-process.
///
/// The model is downloaded from Hugging Face on first use and kept loaded;
/// inference runs on the blocking pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    model: Arc<std::sync::Mutex<Option<fastembed::ImageEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "nomic-embed-vision-v1.5".to_string());
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::ImageEmbeddingModel> {
    match name {
        "clip-vit-b-32" => Ok(fastembed::ImageEmbeddingModel::ClipVitB32),
        "nomic-embed-vision-v1.5" => Ok(fastembed::ImageEmbeddingModel::NomicEmbedVisionV15),
        "resnet50" => Ok(fastembed::ImageEmbeddingModel::Resnet50),
        "unicom-vit-b-16" => Ok(fastembed::ImageEmbeddingModel::UnicomVitB16),
        "unicom-vit-b-32" => Ok(fastembed::ImageEmbeddingModel::UnicomVitB32),
        other => bail!(
            "Unknown local image model: '{}'. Supported models: \
             clip-vit-b-32, nomic-embed-vision-v1.5, resnet50, unicom-vit-b-16, unicom-vit-b-32",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl VisualEmbedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let model_slot = self.model.clone();
        let model_name = self.model_name.clone();
        let bytes = bytes.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = model_slot
                .lock()
                .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let options =
                    fastembed::ImageInitOptions::new(config_to_fastembed_model(&model_name)?)
                        .with_show_download_progress(false);
                let model = fastembed::ImageEmbedding::try_new(options).map_err(|e| {
                    anyhow::anyhow!("Failed to initialize local image model: {}", e)
                })?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("local image model unavailable"))?;

            let mut embeddings = model
                .embed_bytes(&[bytes.as_slice()], None)
                .map_err(|e| anyhow::anyhow!("Local image embedding failed: {}", e))?;
            embeddings
                .pop()
                .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
        })
        .await?
    }
}

/// Create the [`VisualEmbedder`] named by `embedding.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"http"` | [`HttpEmbedder`] |
/// | `"local"` | `LocalEmbedder` (feature `local-embeddings-fastembed`) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn VisualEmbedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "http" => Ok(Arc::new(HttpEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
