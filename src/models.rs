//! Core data models shared by the pipeline, the stores, and the HTTP API.
//!
//! Everything here is plain serde data. Persisted shapes are JSON documents
//! inside SQLite text columns, so field names are part of the storage format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named steps of a turn. The pipeline is a fixed state machine over these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Context,
    Clarification,
    Research,
    Style,
    Ranking,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Context => "context",
            Stage::Clarification => "clarification",
            Stage::Research => "research",
            Stage::Style => "style",
            Stage::Ranking => "ranking",
            Stage::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "context" => Some(Stage::Context),
            "clarification" => Some(Stage::Clarification),
            "research" => Some(Stage::Research),
            "style" => Some(Stage::Style),
            "ranking" => Some(Stage::Ranking),
            "done" => Some(Stage::Done),
            _ => None,
        }
    }
}

/// One transcript entry.
///
/// `role` is kept as written by the producer (`human`, `user`, `HumanMessage`,
/// `assistant`, ...). Comparisons go through [`normalize_role`].
///
/// Deserialization is lenient so transcripts written by older clients stay
/// readable: `role` or `type` names the speaker (`role` wins when both are
/// present), and list or object `content` is flattened to text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredMessage")]
pub struct Message {
    pub role: String,
    pub content: String,
    /// Free-form payload, e.g. the candidates returned with an assistant reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<serde_json::Value>,
}

/// Role given to entries whose speaker could not be determined.
pub const UNKNOWN_ROLE: &str = "unknown";

/// Every shape a transcript entry has been written in.
#[derive(Deserialize)]
struct StoredMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: serde_json::Value,
    #[serde(default)]
    attachments: Option<serde_json::Value>,
    #[serde(default)]
    additional_kwargs: Option<serde_json::Value>,
}

impl From<StoredMessage> for Message {
    fn from(raw: StoredMessage) -> Self {
        let role = [raw.role, raw.kind]
            .into_iter()
            .flatten()
            .find(|r| !r.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_ROLE.to_string());
        let attachments = raw
            .attachments
            .or(raw.additional_kwargs)
            .filter(|v| !v.is_null() && v.as_object().map_or(true, |o| !o.is_empty()));
        Self {
            role,
            content: flatten_content(&raw.content),
            attachments,
        }
    }
}

/// Text of a `content` value: strings as-is, content-part lists joined by
/// newlines, `{"text": ..}` objects by their text, anything else as JSON.
fn flatten_content(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(flatten_content)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => match map.get("text") {
            Some(Value::String(text)) => text.clone(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

impl Message {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: "human".to_string(),
            content: content.into(),
            attachments: None,
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self {
            role: "ai".to_string(),
            content: content.into(),
            attachments: None,
        }
    }

    /// Wraps a stored entry that is not a message at all, keeping its text.
    pub fn opaque(raw: &serde_json::Value) -> Self {
        let content = match raw {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            role: UNKNOWN_ROLE.to_string(),
            content,
            attachments: None,
        }
    }

    pub fn with_attachments(mut self, attachments: serde_json::Value) -> Self {
        self.attachments = Some(attachments);
        self
    }

    /// Dedup key: normalized role plus trimmed content.
    pub fn signature(&self) -> String {
        format!("{}:{}", normalize_role(&self.role), self.content.trim())
    }

    pub fn is_human(&self) -> bool {
        normalize_role(&self.role) == "human"
    }
}

/// Collapses role spellings: anything mentioning human/user becomes `human`,
/// anything mentioning ai/assistant becomes `ai`, the rest is lowercased.
pub fn normalize_role(role: &str) -> String {
    let lower = role.trim().to_lowercase();
    if lower.contains("human") || lower.contains("user") {
        "human".to_string()
    } else if lower.contains("assistant") || lower.contains("ai") {
        "ai".to_string()
    } else {
        lower
    }
}

/// A product returned by search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub image_ref: String,
    /// Display price as returned by the catalog, e.g. `"₹1,299.00"`.
    pub price: String,
    pub link: String,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub review_count: Option<u64>,
}

impl Candidate {
    /// Image, price and link must all be non-empty for a candidate to be usable.
    pub fn is_complete(&self) -> bool {
        !self.image_ref.trim().is_empty()
            && !self.price.trim().is_empty()
            && !self.link.trim().is_empty()
    }
}

/// A candidate after the style stage: the composite image and its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateWithEmbedding {
    /// Unique per generated artifact.
    pub id: String,
    #[serde(flatten)]
    pub candidate: Candidate,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub source_user_photo_ref: Option<String>,
    #[serde(default)]
    pub composite_image_ref: Option<String>,
}

/// Structured shopping intent extracted from the conversation.
///
/// Every field is optional so the record can be merged field by field:
/// a later extraction that leaves a field empty never erases an earlier value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShoppingQuery {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub min_rating: Option<f64>,
    /// `relevance`, `price_low`, `price_high` or `rating_high`.
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub age_group: Option<String>,
    /// `new` or `used`.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_sale: Option<bool>,
    #[serde(default)]
    pub free_shipping: Option<bool>,
    #[serde(default)]
    pub google_domain: Option<String>,
    #[serde(default)]
    pub gl: Option<String>,
    #[serde(default)]
    pub hl: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub start: Option<u32>,
    #[serde(default)]
    pub num: Option<u32>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub no_cache: Option<bool>,
    #[serde(default)]
    pub use_light_api: Option<bool>,
}

impl ShoppingQuery {
    /// The free-text query, if it has any non-whitespace content.
    pub fn query_text(&self) -> Option<&str> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }

    /// Overlays every present field of `newer` onto `self`.
    ///
    /// Absent fields and blank strings in `newer` leave `self` untouched.
    pub fn merge_from(&mut self, newer: &ShoppingQuery) {
        fn text(slot: &mut Option<String>, newer: &Option<String>) {
            if let Some(v) = newer {
                if !v.trim().is_empty() {
                    *slot = Some(v.clone());
                }
            }
        }
        fn value<T: Clone>(slot: &mut Option<T>, newer: &Option<T>) {
            if let Some(v) = newer {
                *slot = Some(v.clone());
            }
        }

        text(&mut self.query, &newer.query);
        value(&mut self.min_price, &newer.min_price);
        value(&mut self.max_price, &newer.max_price);
        value(&mut self.min_rating, &newer.min_rating);
        text(&mut self.sort, &newer.sort);
        text(&mut self.brand, &newer.brand);
        text(&mut self.color, &newer.color);
        text(&mut self.material, &newer.material);
        text(&mut self.size, &newer.size);
        text(&mut self.category, &newer.category);
        text(&mut self.store, &newer.store);
        text(&mut self.gender, &newer.gender);
        text(&mut self.age_group, &newer.age_group);
        text(&mut self.condition, &newer.condition);
        value(&mut self.on_sale, &newer.on_sale);
        value(&mut self.free_shipping, &newer.free_shipping);
        text(&mut self.google_domain, &newer.google_domain);
        text(&mut self.gl, &newer.gl);
        text(&mut self.hl, &newer.hl);
        text(&mut self.location, &newer.location);
        value(&mut self.start, &newer.start);
        value(&mut self.num, &newer.num);
        text(&mut self.device, &newer.device);
        value(&mut self.no_cache, &newer.no_cache);
        value(&mut self.use_light_api, &newer.use_light_api);
    }
}

/// Per-facet preference vectors. `color` may be shorter than the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceEmbeddings {
    pub style: Vec<f32>,
    pub brand: Vec<f32>,
    pub color: Vec<f32>,
    pub intent: Vec<f32>,
    #[serde(default)]
    pub face: Vec<f32>,
}

/// Snapshot of the authoritative user record cached on the thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Object storage keys of the user's own photos.
    #[serde(default)]
    pub photo_refs: Vec<String>,
    #[serde(default)]
    pub preference_embeddings: Option<PreferenceEmbeddings>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// The durable record of one conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: String,
    pub user_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub user_profile: Option<UserProfile>,
    #[serde(default)]
    pub extracted_query: Option<ShoppingQuery>,
    #[serde(default)]
    pub search_results: Option<Vec<Candidate>>,
    #[serde(default)]
    pub styled_candidates: Option<Vec<CandidateWithEmbedding>>,
    #[serde(default)]
    pub ranked_candidates: Option<Vec<CandidateWithEmbedding>>,
    #[serde(default)]
    pub current_stage: Option<Stage>,
    #[serde(default)]
    pub next_stage: Option<Stage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(thread_id: &str, user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            user_id: user_id.to_string(),
            request_id: None,
            messages: Vec::new(),
            user_profile: None,
            extracted_query: None,
            search_results: None,
            styled_candidates: None,
            ranked_candidates: None,
            current_stage: None,
            next_stage: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A partial update for [`ConversationState`].
///
/// `None` means "leave the stored value alone". `messages` is merged, never
/// replaced; `extracted_query` is merged field by field.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub messages: Vec<Message>,
    pub user_profile: Option<UserProfile>,
    pub extracted_query: Option<ShoppingQuery>,
    pub search_results: Option<Vec<Candidate>>,
    pub styled_candidates: Option<Vec<CandidateWithEmbedding>>,
    pub ranked_candidates: Option<Vec<CandidateWithEmbedding>>,
    pub current_stage: Option<Stage>,
    pub next_stage: Option<Stage>,
}

impl StatePatch {
    /// Same patch without the transcript.
    pub fn without_messages(&self) -> StatePatch {
        StatePatch {
            messages: Vec::new(),
            ..self.clone()
        }
    }
}

/// Lightweight listing entry for a user's threads.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub message_count: usize,
    pub last_message: Option<String>,
    pub current_stage: Option<Stage>,
    pub updated_at: DateTime<Utc>,
}
