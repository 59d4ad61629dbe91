//! Deterministic stand-ins for the external services.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tryon_stylist::config::PipelineConfig;
use tryon_stylist::embedding::{EmbeddingGenerator, VisualEmbedder};
use tryon_stylist::models::{
    Candidate, ConversationState, Message, PreferenceEmbeddings, ShoppingQuery, StatePatch,
    ThreadSummary, UserProfile,
};
use tryon_stylist::pipeline::{Collaborators, Orchestrator};
use tryon_stylist::providers::{
    ImageBytes, ImageMerger, IntentCheck, IntentExtractor, ObjectStorage, ProductSearch,
};
use tryon_stylist::ranking::RankingEngine;
use tryon_stylist::store::memory::InMemoryConversationStore;
use tryon_stylist::store::ConversationStore;
use tryon_stylist::users::InMemoryUserDirectory;

pub const DIMS: usize = 4;

// ─── Extractor ──────────────────────────────────────────────────────

/// Recognizes a few product words and colors in the latest human message.
pub struct KeywordExtractor {
    pub calls: Mutex<usize>,
}

impl KeywordExtractor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(0),
        }
    }
}

const PRODUCTS: [&str; 3] = ["kurta", "dress", "sneakers"];
const COLORS: [&str; 3] = ["red", "blue", "black"];

#[async_trait]
impl IntentExtractor for KeywordExtractor {
    async fn classify(&self, messages: &[Message]) -> Result<IntentCheck> {
        let last = messages.iter().rev().find(|m| m.is_human());
        if last.is_some_and(|m| m.content.to_lowercase().contains("weather")) {
            return Ok(IntentCheck {
                is_shopping_related: false,
                response_if_not_related: Some("I can only help with shopping.".into()),
            });
        }
        Ok(IntentCheck::shopping())
    }

    async fn extract(&self, messages: &[Message]) -> Result<ShoppingQuery> {
        *self.calls.lock().unwrap() += 1;
        let text = messages
            .iter()
            .rev()
            .find(|m| m.is_human())
            .map(|m| m.content.to_lowercase())
            .unwrap_or_default();
        if text.contains("gibberish") {
            bail!("model returned invalid JSON");
        }
        let word = |list: &[&str]| list.iter().find(|w| text.contains(*w)).map(|w| w.to_string());
        Ok(ShoppingQuery {
            query: word(&PRODUCTS),
            color: word(&COLORS),
            ..Default::default()
        })
    }
}

// ─── Search ─────────────────────────────────────────────────────────

pub struct FakeSearch {
    pub results: Vec<Candidate>,
}

#[async_trait]
impl ProductSearch for FakeSearch {
    async fn search(&self, _query: &ShoppingQuery) -> Result<Vec<Candidate>> {
        Ok(self.results.clone())
    }
}

pub fn candidate(name: &str, price: &str) -> Candidate {
    Candidate {
        image_ref: format!("https://img.test/{}.jpg", name),
        price: price.to_string(),
        link: format!("https://shop.test/{}", name),
        rating: Some(4.2),
        title: name.to_string(),
        source: "Test Store".to_string(),
        review_count: Some(10),
    }
}

// ─── Merger ─────────────────────────────────────────────────────────

/// Returns the product URL as the "composite" bytes.
pub struct EchoMerger {
    pub fail_for: HashSet<String>,
    pub delay: Option<Duration>,
}

impl EchoMerger {
    pub fn ok() -> Self {
        Self {
            fail_for: HashSet::new(),
            delay: None,
        }
    }

    pub fn failing(urls: &[&str]) -> Self {
        Self {
            fail_for: urls.iter().map(|u| u.to_string()).collect(),
            delay: None,
        }
    }
}

#[async_trait]
impl ImageMerger for EchoMerger {
    async fn merge(
        &self,
        person: &ImageBytes,
        product_image_url: &str,
        _prompt: &str,
    ) -> Result<ImageBytes> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if person.bytes.is_empty() {
            bail!("empty person image");
        }
        if self.fail_for.contains(product_image_url) {
            bail!("merge refused for {}", product_image_url);
        }
        Ok(ImageBytes::new(product_image_url.as_bytes().to_vec(), "image/png"))
    }
}

// ─── Embedder ───────────────────────────────────────────────────────

/// Looks up the vector for the composite bytes (the product URL).
pub struct TableEmbedder {
    pub table: HashMap<Vec<u8>, Vec<f32>>,
}

#[async_trait]
impl VisualEmbedder for TableEmbedder {
    fn model_name(&self) -> &str {
        "table"
    }

    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        self.table
            .get(bytes)
            .cloned()
            .ok_or_else(|| anyhow!("no vector for image"))
    }
}

// ─── Storage ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStorage {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub refuse_presign: bool,
}

impl MemoryStorage {
    pub fn with(key: &str, bytes: &[u8]) -> Self {
        let s = Self::default();
        s.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        s
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(&self, bytes: &[u8], key: &str, _content_type: &str) -> Result<String> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("Object not found: {}", key))
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if self.refuse_presign {
            bail!("presign refused for {}", key);
        }
        Ok(format!("https://objects.test/{}?ttl={}", key, ttl.as_secs()))
    }
}

// ─── Broken store ───────────────────────────────────────────────────

/// Reads nothing and refuses every write.
pub struct BrokenStore;

#[async_trait]
impl ConversationStore for BrokenStore {
    async fn get(&self, _thread_id: &str) -> Result<Option<ConversationState>> {
        Ok(None)
    }

    async fn upsert(
        &self,
        _thread_id: &str,
        _user_id: &str,
        _patch: &StatePatch,
        _request_id: Option<&str>,
    ) -> Result<ConversationState> {
        bail!("database is locked")
    }

    async fn delete(&self, _thread_id: &str) -> Result<bool> {
        bail!("database is locked")
    }

    async fn list_for_user(&self, _user_id: &str) -> Result<Vec<ThreadSummary>> {
        Ok(Vec::new())
    }
}

// ─── Harness ────────────────────────────────────────────────────────

pub const PHOTO_KEY: &str = "photos/u1/me.png";

/// Unit vector along axis `i`.
pub fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[i] = 1.0;
    v
}

pub fn profile(with_embeddings: bool) -> UserProfile {
    UserProfile {
        user_id: "u1".into(),
        username: Some("asha".into()),
        photo_refs: vec![PHOTO_KEY.to_string()],
        preference_embeddings: with_embeddings.then(|| PreferenceEmbeddings {
            style: axis(0),
            brand: axis(0),
            color: vec![0.5; 2],
            intent: axis(0),
            face: axis(0),
        }),
        attributes: Default::default(),
    }
}

pub struct Harness {
    pub store: Arc<dyn ConversationStore>,
    pub storage: Arc<MemoryStorage>,
    pub extractor: Arc<KeywordExtractor>,
    pub orchestrator: Orchestrator,
}

pub struct HarnessBuilder {
    pub store: Arc<dyn ConversationStore>,
    pub profile: Option<UserProfile>,
    pub results: Vec<Candidate>,
    pub merger: EchoMerger,
    pub settings: PipelineConfig,
    pub refuse_presign: bool,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryConversationStore::new()),
            profile: Some(profile(true)),
            results: vec![
                candidate("plain-kurta", "₹899"),
                candidate("silk-kurta", "₹1,499"),
                candidate("linen-kurta", "₹1,199"),
            ],
            merger: EchoMerger::ok(),
            settings: PipelineConfig::default(),
            refuse_presign: false,
        }
    }

    pub fn build(self) -> Harness {
        // First result points away from the user's style, second matches it.
        let table = self
            .results
            .iter()
            .zip([axis(1), axis(0)])
            .map(|(c, v)| (c.image_ref.as_bytes().to_vec(), v))
            .collect();
        let embeddings = EmbeddingGenerator::new(
            Arc::new(TableEmbedder { table }),
            DIMS,
            8,
            Duration::from_secs(5),
        );

        let storage = Arc::new(MemoryStorage {
            refuse_presign: self.refuse_presign,
            ..MemoryStorage::with(PHOTO_KEY, b"person-photo")
        });
        let extractor = Arc::new(KeywordExtractor::new());
        let deps = Collaborators {
            store: self.store.clone(),
            users: Arc::new(InMemoryUserDirectory::with_profiles(self.profile)),
            extractor: extractor.clone(),
            search: Arc::new(FakeSearch {
                results: self.results,
            }),
            merger: Arc::new(self.merger),
            storage: storage.clone(),
        };
        let orchestrator = Orchestrator::new(
            deps,
            embeddings,
            RankingEngine::with_zero_standard(DIMS),
            self.settings,
        );
        Harness {
            store: self.store,
            storage,
            extractor,
            orchestrator,
        }
    }
}
