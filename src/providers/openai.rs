//! Intent gate and query extraction over an OpenAI-compatible
//! `chat/completions` endpoint with JSON-schema structured output.
//!
//! Requires `OPENAI_API_KEY`. `extraction.api_base` can point at any
//! compatible server.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ExtractionConfig;
use crate::models::{normalize_role, Message, ShoppingQuery};

use super::{env_key, send_json_with_retry, IntentCheck, IntentExtractor};

const INTENT_PROMPT: &str = "You are the front desk of a fashion shopping assistant. Decide whether \
the user's latest message is about finding, comparing or buying clothing, footwear or accessories. \
If it is not, write a short friendly reply that answers briefly and steers the user back to shopping.";

const EXTRACTION_PROMPT: &str = "Extract a product search from the conversation. `query` is a short \
search phrase for the product the user wants now, or an empty string if they have not said what \
they want. Fill a filter only when the user stated it; otherwise return null. Prices are plain \
numbers in the user's currency. `sort` is one of relevance, price_low, price_high, rating_high. \
`condition` is new or used.";

pub struct OpenAiExtractor {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    intent_window: usize,
    max_retries: u32,
}

impl OpenAiExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let api_key = env_key("OPENAI_API_KEY")
            .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            intent_window: config.intent_window,
            max_retries: config.max_retries,
        })
    }

    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        schema_name: &str,
        schema: Value,
    ) -> Result<Value> {
        let mut chat = vec![json!({ "role": "system", "content": system })];
        chat.extend(messages.iter().map(to_chat_message));

        let body = json!({
            "model": self.model,
            "messages": chat,
            "temperature": 0,
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": schema_name, "schema": schema },
            },
        });

        let url = format!("{}/chat/completions", self.api_base);
        let response = send_json_with_retry("OpenAI", self.max_retries, || {
            self.client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
        })
        .await?;

        let content = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))?;
        serde_json::from_str(content).context("OpenAI returned content that is not JSON")
    }
}

#[async_trait]
impl IntentExtractor for OpenAiExtractor {
    async fn classify(&self, messages: &[Message]) -> Result<IntentCheck> {
        let start = messages.len().saturating_sub(self.intent_window);
        let value = self
            .complete(INTENT_PROMPT, &messages[start..], "intent_check", intent_schema())
            .await?;
        serde_json::from_value(value).context("Invalid intent check payload")
    }

    async fn extract(&self, messages: &[Message]) -> Result<ShoppingQuery> {
        let value = self
            .complete(EXTRACTION_PROMPT, messages, "shopping_query", query_schema())
            .await?;
        let query: ShoppingQuery =
            serde_json::from_value(value).context("Invalid shopping query payload")?;
        Ok(strip_placeholders(query))
    }
}

fn to_chat_message(msg: &Message) -> Value {
    let role = match normalize_role(&msg.role).as_str() {
        "human" => "user",
        "ai" => "assistant",
        _ => "system",
    };
    json!({ "role": role, "content": msg.content })
}

fn intent_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "is_shopping_related": { "type": "boolean" },
            "response_if_not_related": { "type": ["string", "null"] },
        },
        "required": ["is_shopping_related"],
    })
}

fn query_schema() -> Value {
    let text = json!({ "type": ["string", "null"] });
    let number = json!({ "type": ["number", "null"] });
    let flag = json!({ "type": ["boolean", "null"] });
    let count = json!({ "type": ["integer", "null"] });
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string" },
            "min_price": number, "max_price": number, "min_rating": number,
            "sort": { "type": ["string", "null"], "enum": ["relevance", "price_low", "price_high", "rating_high", null] },
            "brand": text, "color": text, "material": text, "size": text,
            "category": text, "store": text, "gender": text, "age_group": text,
            "condition": { "type": ["string", "null"], "enum": ["new", "used", null] },
            "on_sale": flag, "free_shipping": flag,
            "google_domain": text, "gl": text, "hl": text, "location": text,
            "start": count, "num": count,
            "device": text, "no_cache": flag, "use_light_api": flag,
        },
        "required": ["query"],
    })
}

/// Models sometimes spell "unknown" as a string. Those become `None`.
fn strip_placeholders(mut q: ShoppingQuery) -> ShoppingQuery {
    fn clean(slot: &mut Option<String>) {
        if let Some(v) = slot {
            let lower = v.trim().to_ascii_lowercase();
            if matches!(lower.as_str(), "" | "null" | "none" | "n/a" | "na" | "unknown" | "any") {
                *slot = None;
            }
        }
    }
    for slot in [
        &mut q.sort,
        &mut q.brand,
        &mut q.color,
        &mut q.material,
        &mut q.size,
        &mut q.category,
        &mut q.store,
        &mut q.gender,
        &mut q.age_group,
        &mut q.condition,
        &mut q.google_domain,
        &mut q.gl,
        &mut q.hl,
        &mut q.location,
        &mut q.device,
    ] {
        clean(slot);
    }
    if let Some(query) = &q.query {
        if query.trim().is_empty() {
            q.query = None;
        }
    }
    for price in [&mut q.min_price, &mut q.max_price] {
        if price.is_some_and(|p| p <= 0.0) {
            *price = None;
        }
    }
    if q.min_rating.is_some_and(|r| !(0.0..=5.0).contains(&r) || r == 0.0) {
        q.min_rating = None;
    }
    q
}
