//! Configuration parsing and validation.
//!
//! The stylist reads a single TOML file (default `./config/stylist.toml`).
//! Every section except `[db]` is optional and falls back to the defaults
//! below. Secrets never live in the file; providers read them from the
//! environment when they are constructed.
//!
//! ```toml
//! [db]
//! path = "./data/stylist.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! log_level = "info"
//!
//! [pipeline]
//! style_candidates = 2
//!
//! [embedding]
//! provider = "http"
//! url = "http://localhost:8080/embed"
//!
//! [storage]
//! backend = "s3"
//! bucket = "tryon-composites"
//! region = "ap-south-1"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub image_merge: ImageMergeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// `tracing` filter directive, overridden by `RUST_LOG` when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            log_level: default_log_level(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Knobs for the turn pipeline. Timeouts bound every external call.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// How many search results are sent through the image merge stage.
    #[serde(default = "default_style_candidates")]
    pub style_candidates: usize,
    #[serde(default = "default_extraction_timeout")]
    pub extraction_timeout_secs: u64,
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_merge_timeout")]
    pub merge_timeout_secs: u64,
    #[serde(default = "default_storage_timeout")]
    pub storage_timeout_secs: u64,
    #[serde(default = "default_persist_timeout")]
    pub persist_timeout_secs: u64,
    /// Lifetime of the presigned composite URLs returned to clients.
    #[serde(default = "default_presign_ttl")]
    pub presign_ttl_secs: u64,
    #[serde(default = "default_tryon_prompt")]
    pub tryon_prompt: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            style_candidates: default_style_candidates(),
            extraction_timeout_secs: default_extraction_timeout(),
            search_timeout_secs: default_search_timeout(),
            merge_timeout_secs: default_merge_timeout(),
            storage_timeout_secs: default_storage_timeout(),
            persist_timeout_secs: default_persist_timeout(),
            presign_ttl_secs: default_presign_ttl(),
            tryon_prompt: default_tryon_prompt(),
        }
    }
}

fn default_style_candidates() -> usize {
    2
}
fn default_extraction_timeout() -> u64 {
    30
}
fn default_search_timeout() -> u64 {
    20
}
fn default_merge_timeout() -> u64 {
    90
}
fn default_storage_timeout() -> u64 {
    20
}
fn default_persist_timeout() -> u64 {
    10
}
fn default_presign_ttl() -> u64 {
    3600
}
fn default_tryon_prompt() -> String {
    "Create a realistic virtual try-on image. The first image is the person and the second \
     image is the product. Dress the person in the product while keeping their face, body \
     shape, pose and the background unchanged. Match the product's color, texture and fit \
     exactly and return a single photorealistic image."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `http` or `local`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Endpoint for the `http` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_visual_dims")]
    pub visual_dims: usize,
    #[serde(default = "default_color_dims")]
    pub color_dims: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            visual_dims: default_visual_dims(),
            color_dims: default_color_dims(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_visual_dims() -> usize {
    768
}
fn default_color_dims() -> usize {
    256
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RankingConfig {
    /// JSON array of floats used as the reference standard. Zero vector when unset.
    #[serde(default)]
    pub standard_embedding_path: Option<PathBuf>,
}

/// OpenAI-compatible chat completions endpoint used for intent extraction.
#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_model")]
    pub model: String,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
    /// Number of trailing messages the shopping-intent gate looks at.
    #[serde(default = "default_intent_window")]
    pub intent_window: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            model: default_extraction_model(),
            api_base: default_openai_base(),
            intent_window: default_intent_window(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_extraction_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_intent_window() -> usize {
    5
}

/// Defaults for the SerpApi Google Shopping engine. Extracted intent wins
/// over these when it carries its own values.
#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_serpapi_base")]
    pub api_base: String,
    #[serde(default = "default_google_domain")]
    pub google_domain: String,
    #[serde(default = "default_gl")]
    pub gl: String,
    #[serde(default = "default_hl")]
    pub hl: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_num")]
    pub num: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_base: default_serpapi_base(),
            google_domain: default_google_domain(),
            gl: default_gl(),
            hl: default_hl(),
            location: default_location(),
            num: default_num(),
        }
    }
}

fn default_serpapi_base() -> String {
    "https://serpapi.com".to_string()
}
fn default_google_domain() -> String {
    "google.co.in".to_string()
}
fn default_gl() -> String {
    "in".to_string()
}
fn default_hl() -> String {
    "en".to_string()
}
fn default_location() -> String {
    "India".to_string()
}
fn default_num() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageMergeConfig {
    #[serde(default = "default_merge_model")]
    pub model: String,
    #[serde(default = "default_gemini_base")]
    pub api_base: String,
}

impl Default for ImageMergeConfig {
    fn default() -> Self {
        Self {
            model: default_merge_model(),
            api_base: default_gemini_base(),
        }
    }
}

fn default_merge_model() -> String {
    "gemini-2.5-flash-image".to_string()
}
fn default_gemini_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

/// Object storage for user photos and composites.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `fs` or `s3`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Root directory for the `fs` backend.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            root: default_storage_root(),
            bucket: None,
            region: None,
            endpoint_url: None,
            prefix: String::new(),
        }
    }
}

fn default_storage_backend() -> String {
    "fs".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/objects")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pipeline.style_candidates == 0 {
        anyhow::bail!("pipeline.style_candidates must be >= 1");
    }

    if config.embedding.visual_dims == 0 || config.embedding.color_dims == 0 {
        anyhow::bail!("embedding.visual_dims and embedding.color_dims must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "http" => {
            if config.embedding.url.is_none() {
                anyhow::bail!("embedding.url must be specified when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, http, or local.",
            other
        ),
    }

    if config.extraction.intent_window == 0 {
        anyhow::bail!("extraction.intent_window must be >= 1");
    }

    match config.storage.backend.as_str() {
        "fs" => {}
        "s3" => {
            if config.storage.bucket.is_none() || config.storage.region.is_none() {
                anyhow::bail!("storage.bucket and storage.region are required for the s3 backend");
            }
        }
        other => anyhow::bail!("Unknown storage backend: '{}'. Must be fs or s3.", other),
    }

    Ok(())
}
