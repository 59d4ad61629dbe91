//! Virtual try-on composites via Gemini `generateContent`.
//!
//! The request carries the person photo first, the product image second,
//! and the try-on prompt last. The first inline image in the response is
//! the composite.
//!
//! Requires `GEMINI_API_KEY` (or `GOOGLE_API_KEY`).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::config::ImageMergeConfig;

use super::{env_key, mime_from_key, send_json_with_retry, ImageBytes, ImageMerger};

pub struct GeminiMerger {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl GeminiMerger {
    pub fn new(config: &ImageMergeConfig) -> Result<Self> {
        let api_key = env_key("GEMINI_API_KEY")
            .or_else(|| env_key("GOOGLE_API_KEY"))
            .ok_or_else(|| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            endpoint: endpoint_for_model(&config.api_base, &config.model),
        })
    }

    async fn fetch_product(&self, url: &str) -> Result<ImageBytes> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to download product image {}", url))?;
        if !resp.status().is_success() {
            bail!("Product image download failed (HTTP {}): {}", resp.status(), url);
        }
        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("image/"))
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| mime_from_key(url).to_string());
        let bytes = resp.bytes().await?.to_vec();
        if bytes.is_empty() {
            bail!("Product image is empty: {}", url);
        }
        Ok(ImageBytes::new(bytes, mime_type))
    }
}

fn endpoint_for_model(api_base: &str, model: &str) -> String {
    let trimmed = model.trim();
    let model_path = if trimmed.starts_with("models/") {
        trimmed.to_string()
    } else {
        format!("models/{}", trimmed)
    };
    format!(
        "{}/{}:generateContent",
        api_base.trim().trim_end_matches('/'),
        model_path
    )
}

fn image_part(image: &ImageBytes) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": BASE64.encode(&image.bytes),
        }
    })
}

/// Returns the first inline image in a `generateContent` response.
fn first_inline_image(response: &Value) -> Result<ImageBytes> {
    let candidates = response
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for candidate in &candidates {
        let parts = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in &parts {
            let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                continue;
            };
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.as_bytes())
                .context("Gemini image base64 decode failed")?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png")
                .to_string();
            return Ok(ImageBytes::new(bytes, mime_type));
        }
    }

    let reason = response
        .pointer("/promptFeedback/blockReason")
        .or_else(|| response.pointer("/candidates/0/finishReason"))
        .and_then(Value::as_str)
        .unwrap_or("no image in response");
    bail!("Gemini returned no composite: {}", reason)
}

#[async_trait]
impl ImageMerger for GeminiMerger {
    async fn merge(
        &self,
        person: &ImageBytes,
        product_image_url: &str,
        prompt: &str,
    ) -> Result<ImageBytes> {
        let product = self.fetch_product(product_image_url).await?;

        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [image_part(person), image_part(&product), { "text": prompt }],
            }],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
        });

        let response = send_json_with_retry("Gemini", 1, || {
            self.client
                .post(&self.endpoint)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
        })
        .await?;

        first_inline_image(&response)
    }
}
