//! The turn pipeline: a fixed state machine over [`Stage`]s.
//!
//! ```text
//!                      ┌──────────────┐
//!  message ──▶ Context ┤              ├──▶ Clarification ──▶ reply
//!                      └──▶ Research ──▶ Style ──▶ Ranking ──▶ reply
//!                              │          │
//!                              ▼          ▼
//!                         no results   all merges fail
//!                           reply        reply
//! ```
//!
//! Every stage returns a [`StageResult`]: the fields it produced and where
//! to go next. After each stage those fields (never the transcript) are
//! upserted into the thread's [`ConversationState`]. When a stage ends the
//! turn, the reply is appended to the transcript and the transcript is
//! upserted once. A paused conversation resumes by simply sending the next
//! message; every turn re-enters at `Context` with the persisted state.
//!
//! Failures never cross a stage boundary. Each stage maps its collaborator
//! errors to a [`StageFailure`], logs it, and picks its fallback reply.
//! Persistence errors are logged and do not affect the response.

mod context;
mod rank;
mod research;
mod style;

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, PipelineConfig};
use crate::embedding::EmbeddingGenerator;
use crate::models::{
    Candidate, CandidateWithEmbedding, ConversationState, Message, ShoppingQuery, Stage,
    StatePatch, UserProfile,
};
use crate::providers::{
    create_providers, ImageMerger, IntentExtractor, ObjectStorage, ProductSearch,
};
use crate::ranking::RankingEngine;
use crate::store::sqlite::SqliteConversationStore;
use crate::store::ConversationStore;
use crate::users::{SqliteUserDirectory, UserDirectory};

/// One inbound chat message.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub thread_id: Option<String>,
    pub user_id: String,
    pub message: String,
}

/// How the turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    NotShopping,
    Clarify,
    NoResults,
    StyleFailed,
    Unranked,
    Ranked,
}

/// A candidate as shown to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductCard {
    pub id: String,
    pub title: String,
    pub price: String,
    pub link: String,
    pub image_ref: String,
    pub rating: Option<f64>,
    pub source: String,
    pub composite_image_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub thread_id: String,
    pub request_id: String,
    pub response_text: String,
    pub outcome: TurnOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<ProductCard>>,
    /// Presigned URLs of the composites, one per candidate in the same order;
    /// `null` where the composite is missing or could not be presigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite_image_refs: Option<Vec<Option<String>>>,
}

/// Recoverable failures, each with a stage-specific fallback.
#[derive(Debug, thiserror::Error)]
pub enum StageFailure {
    #[error("intent extraction failed: {0}")]
    Extraction(String),
    #[error("product search failed: {0}")]
    Search(String),
    #[error("no products matched the query")]
    SearchEmpty,
    #[error("no user photo available for try-on")]
    NoUserPhoto,
    #[error("image merge failed for every candidate")]
    AllMergesFailed,
    #[error("user preference embeddings missing")]
    MissingProfile,
}

/// Where a stage sends the turn next.
pub(crate) enum Transition {
    Next(Stage),
    Reply(Reply),
}

pub(crate) struct Reply {
    pub text: String,
    pub outcome: TurnOutcome,
    pub candidates: Vec<CandidateWithEmbedding>,
}

impl Reply {
    fn text_only(text: impl Into<String>, outcome: TurnOutcome) -> Self {
        Self {
            text: text.into(),
            outcome,
            candidates: Vec::new(),
        }
    }
}

pub(crate) struct StageResult {
    pub patch: StatePatch,
    pub transition: Transition,
}

/// Why the turn needs clarification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClarifyReason {
    MissingQuery,
    ExtractionFailed,
}

/// Working state of a single turn.
pub(crate) struct Turn {
    pub thread_id: String,
    pub user_id: String,
    pub request_id: String,
    pub transcript: Vec<Message>,
    pub profile: Option<UserProfile>,
    pub intent: Option<ShoppingQuery>,
    pub candidates: Vec<Candidate>,
    pub styled: Vec<CandidateWithEmbedding>,
    pub clarify_reason: ClarifyReason,
}

/// Injected collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ConversationStore>,
    pub users: Arc<dyn UserDirectory>,
    pub extractor: Arc<dyn IntentExtractor>,
    pub search: Arc<dyn ProductSearch>,
    pub merger: Arc<dyn ImageMerger>,
    pub storage: Arc<dyn ObjectStorage>,
}

#[derive(Clone)]
pub struct Orchestrator {
    deps: Collaborators,
    embeddings: EmbeddingGenerator,
    ranking: RankingEngine,
    settings: PipelineConfig,
}

pub fn new_thread_id() -> String {
    format!("thread_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn new_request_id() -> String {
    format!("req_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Runs `fut` with a deadline; expiry becomes an error naming `label`.
pub(crate) async fn bounded<T, F>(label: &str, secs: u64, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(result) => result,
        Err(_) => bail!("{} timed out after {}s", label, secs),
    }
}

impl Orchestrator {
    pub fn new(
        deps: Collaborators,
        embeddings: EmbeddingGenerator,
        ranking: RankingEngine,
        settings: PipelineConfig,
    ) -> Self {
        Self {
            deps,
            embeddings,
            ranking,
            settings,
        }
    }

    /// Wires the production collaborators: SQLite stores on `pool` plus the
    /// HTTP providers named in `config`.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let providers = create_providers(config)?;
        let embeddings = EmbeddingGenerator::from_config(&config.embedding)?;
        let ranking = match &config.ranking.standard_embedding_path {
            Some(path) => RankingEngine::from_file(path, config.embedding.visual_dims)?,
            None => {
                tracing::warn!("no standard embedding configured, using zero vector");
                RankingEngine::with_zero_standard(config.embedding.visual_dims)
            }
        };

        let deps = Collaborators {
            store: Arc::new(SqliteConversationStore::new(pool.clone())),
            users: Arc::new(SqliteUserDirectory::new(pool)),
            extractor: providers.extractor,
            search: providers.search,
            merger: providers.merger,
            storage: providers.storage,
        };
        Ok(Self::new(deps, embeddings, ranking, config.pipeline.clone()))
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.deps.store
    }

    pub fn users(&self) -> &Arc<dyn UserDirectory> {
        &self.deps.users
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.deps.storage
    }

    pub fn embeddings(&self) -> &EmbeddingGenerator {
        &self.embeddings
    }

    /// Creates an empty thread for `user_id` and returns its id.
    pub async fn create_thread(&self, user_id: &str) -> Result<String> {
        let thread_id = new_thread_id();
        let profile = self.deps.users.get_profile(user_id).await?;
        let patch = StatePatch {
            user_profile: profile,
            current_stage: Some(Stage::Context),
            next_stage: Some(Stage::Context),
            ..Default::default()
        };
        self.deps
            .store
            .upsert(&thread_id, user_id, &patch, None)
            .await?;
        Ok(thread_id)
    }

    /// Handles one chat message end to end. Never fails once `user_id` is valid.
    pub async fn run_turn(&self, req: TurnRequest) -> Result<TurnResponse> {
        if req.user_id.trim().is_empty() {
            bail!("user_id must not be empty");
        }

        let requested = req
            .thread_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_thread_id);
        let request_id = new_request_id();

        let prior = match self.deps.store.get(&requested).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    thread_id = %requested,
                    error = %e,
                    "failed to load thread state, starting fresh"
                );
                None
            }
        };
        // Another user's thread is never read or written; the turn moves to a new one.
        let (thread_id, prior) = match prior {
            Some(state) if state.user_id != req.user_id => {
                let fresh = new_thread_id();
                tracing::warn!(
                    thread_id = %requested,
                    user_id = %req.user_id,
                    new_thread_id = %fresh,
                    "thread belongs to another user, starting a new thread"
                );
                (fresh, None)
            }
            other => (requested, other),
        };
        let profile = self.refresh_profile(&req.user_id, prior.as_ref()).await;

        let mut transcript = prior.as_ref().map(|s| s.messages.clone()).unwrap_or_default();
        transcript.push(Message::human(req.message.clone()));

        let mut turn = Turn {
            thread_id,
            user_id: req.user_id,
            request_id,
            transcript,
            intent: prior.as_ref().and_then(|s| s.extracted_query.clone()),
            profile,
            candidates: Vec::new(),
            styled: Vec::new(),
            clarify_reason: ClarifyReason::MissingQuery,
        };

        tracing::info!(
            thread_id = %turn.thread_id,
            request_id = %turn.request_id,
            user_id = %turn.user_id,
            "turn started"
        );

        let mut stage = Stage::Context;
        let reply = loop {
            let result = match stage {
                Stage::Context => self.context_stage(&mut turn).await,
                Stage::Clarification => self.clarification_stage(&turn),
                Stage::Research => self.research_stage(&mut turn).await,
                Stage::Style => self.style_stage(&mut turn).await,
                Stage::Ranking => self.ranking_stage(&turn),
                Stage::Done => bail!("stage loop entered Done without a reply"),
            };

            self.persist(&turn, &result.patch.without_messages()).await;

            match result.transition {
                Transition::Next(next) => {
                    tracing::debug!(
                        thread_id = %turn.thread_id,
                        from = stage.as_str(),
                        to = next.as_str(),
                        "stage transition"
                    );
                    stage = next;
                }
                Transition::Reply(reply) => break reply,
            }
        };

        self.finish(turn, reply).await
    }

    /// Prefers the authoritative user record, falling back to the snapshot
    /// cached on the thread when that snapshot is the same user's.
    async fn refresh_profile(
        &self,
        user_id: &str,
        prior: Option<&ConversationState>,
    ) -> Option<UserProfile> {
        let cached = prior
            .and_then(|s| s.user_profile.clone())
            .filter(|p| p.user_id == user_id);
        match self.deps.users.get_profile(user_id).await {
            Ok(Some(profile)) => Some(profile),
            Ok(None) => cached,
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "user lookup failed, using cached profile");
                cached
            }
        }
    }

    async fn persist(&self, turn: &Turn, patch: &StatePatch) {
        let result = bounded(
            "state persist",
            self.settings.persist_timeout_secs,
            self.deps.store.upsert(
                &turn.thread_id,
                &turn.user_id,
                patch,
                Some(&turn.request_id),
            ),
        )
        .await;
        if let Err(e) = result {
            tracing::error!(
                thread_id = %turn.thread_id,
                request_id = %turn.request_id,
                error = %e,
                "failed to persist conversation state"
            );
        }
    }

    /// Appends the reply, syncs the transcript, and builds the response.
    async fn finish(&self, mut turn: Turn, reply: Reply) -> Result<TurnResponse> {
        let mut cards = Vec::with_capacity(reply.candidates.len());
        for c in &reply.candidates {
            let url = match &c.composite_image_ref {
                Some(key) => self.presign(key).await,
                None => None,
            };
            cards.push(ProductCard {
                id: c.id.clone(),
                title: c.candidate.title.clone(),
                price: c.candidate.price.clone(),
                link: c.candidate.link.clone(),
                image_ref: c.candidate.image_ref.clone(),
                rating: c.candidate.rating,
                source: c.candidate.source.clone(),
                composite_image_ref: url,
            });
        }

        let mut message = Message::ai(reply.text.clone());
        if !cards.is_empty() {
            message = message.with_attachments(serde_json::json!({
                "outcome": reply.outcome,
                "candidates": cards,
            }));
        }
        turn.transcript.push(message);

        let transcript_patch = StatePatch {
            messages: std::mem::take(&mut turn.transcript),
            ..Default::default()
        };
        self.persist(&turn, &transcript_patch).await;

        tracing::info!(
            thread_id = %turn.thread_id,
            request_id = %turn.request_id,
            outcome = ?reply.outcome,
            candidates = cards.len(),
            "turn finished"
        );

        let has_cards = !cards.is_empty();
        let urls: Vec<Option<String>> = cards
            .iter()
            .map(|c| c.composite_image_ref.clone())
            .collect();
        Ok(TurnResponse {
            thread_id: turn.thread_id,
            request_id: turn.request_id,
            response_text: reply.text,
            outcome: reply.outcome,
            candidates: has_cards.then_some(cards),
            composite_image_refs: has_cards.then_some(urls),
        })
    }

    async fn presign(&self, key: &str) -> Option<String> {
        let ttl = Duration::from_secs(self.settings.presign_ttl_secs);
        match bounded(
            "presign",
            self.settings.storage_timeout_secs,
            self.deps.storage.presigned_url(key, ttl),
        )
        .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(%key, error = %e, "failed to presign composite");
                None
            }
        }
    }
}
