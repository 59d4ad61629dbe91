//! Style stage: virtual try-on composites and their embeddings.
//!
//! The first `style_candidates` search results are each merged with one
//! randomly chosen user photo. Pairs run concurrently and fail
//! independently; only when every pair fails does the turn end here.

use anyhow::Result;
use futures_util::future::join_all;
use rand::seq::SliceRandom;

use crate::models::{Candidate, CandidateWithEmbedding, Stage, StatePatch};
use crate::providers::{mime_from_key, ImageBytes};

use super::{bounded, Orchestrator, Reply, StageFailure, StageResult, Transition, Turn, TurnOutcome};

const STYLE_FAILED_REPLY: &str = "Sorry, I found some products but couldn't create try-on \
    previews for them right now. Please try again in a moment.";

const NO_PHOTO_REPLY: &str = "I found some products, but I need a photo of you to create \
    try-on previews. Please upload a photo and ask again.";

impl Orchestrator {
    pub(super) async fn style_stage(&self, turn: &mut Turn) -> StageResult {
        let mut patch = StatePatch {
            current_stage: Some(Stage::Style),
            ..Default::default()
        };

        let photo_ref = turn
            .profile
            .as_ref()
            .and_then(|p| p.photo_refs.choose(&mut rand::thread_rng()).cloned());

        let person = match photo_ref {
            Some(key) => self.load_photo(&key).await.map(|bytes| (key, bytes)),
            None => Err(anyhow::Error::new(StageFailure::NoUserPhoto)),
        };
        let (photo_ref, person) = match person {
            Ok(found) => found,
            Err(e) => {
                let no_photo = matches!(
                    e.downcast_ref::<StageFailure>(),
                    Some(StageFailure::NoUserPhoto)
                );
                tracing::warn!(thread_id = %turn.thread_id, error = %e, "no user photo for try-on");
                let text = if no_photo { NO_PHOTO_REPLY } else { STYLE_FAILED_REPLY };
                return style_failed(patch, text);
            }
        };

        let pairs: Vec<&Candidate> = turn
            .candidates
            .iter()
            .take(self.settings.style_candidates)
            .collect();
        let attempts = pairs.len();

        let results = join_all(
            pairs
                .into_iter()
                .map(|c| self.style_one(&turn.thread_id, &photo_ref, &person, c)),
        )
        .await;

        let mut styled = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(c) => styled.push(c),
                Err(e) => {
                    tracing::warn!(thread_id = %turn.thread_id, error = %e, "try-on failed for candidate");
                }
            }
        }

        if styled.is_empty() {
            tracing::error!(
                thread_id = %turn.thread_id,
                attempts,
                error = %StageFailure::AllMergesFailed,
                "style stage produced nothing"
            );
            return style_failed(patch, STYLE_FAILED_REPLY);
        }

        tracing::info!(thread_id = %turn.thread_id, styled = styled.len(), attempts, "style stage done");
        patch.styled_candidates = Some(styled.clone());
        patch.next_stage = Some(Stage::Ranking);
        turn.styled = styled;
        StageResult {
            patch,
            transition: Transition::Next(Stage::Ranking),
        }
    }

    async fn load_photo(&self, key: &str) -> Result<ImageBytes> {
        let bytes = bounded(
            "photo download",
            self.settings.storage_timeout_secs,
            self.deps.storage.get(key),
        )
        .await?;
        Ok(ImageBytes::new(bytes, mime_from_key(key)))
    }

    /// Merge, store, and embed one candidate.
    async fn style_one(
        &self,
        thread_id: &str,
        photo_ref: &str,
        person: &ImageBytes,
        candidate: &Candidate,
    ) -> Result<CandidateWithEmbedding> {
        let composite = bounded(
            "image merge",
            self.settings.merge_timeout_secs,
            self.deps
                .merger
                .merge(person, &candidate.image_ref, &self.settings.tryon_prompt),
        )
        .await?;

        let id = uuid::Uuid::new_v4().to_string();
        let key = format!("composites/{}/{}.{}", thread_id, id, composite.extension());
        let composite_ref = match bounded(
            "composite upload",
            self.settings.storage_timeout_secs,
            self.deps
                .storage
                .upload(&composite.bytes, &key, &composite.mime_type),
        )
        .await
        {
            Ok(stored) => Some(stored),
            Err(e) => {
                tracing::warn!(%key, error = %e, "composite upload failed, keeping candidate");
                None
            }
        };

        let embedding = self.embeddings.visual(&composite.bytes).await;

        Ok(CandidateWithEmbedding {
            id,
            candidate: candidate.clone(),
            embedding,
            source_user_photo_ref: Some(photo_ref.to_string()),
            composite_image_ref: composite_ref,
        })
    }
}

fn style_failed(mut patch: StatePatch, text: &str) -> StageResult {
    patch.styled_candidates = Some(Vec::new());
    patch.next_stage = Some(Stage::Done);
    StageResult {
        patch,
        transition: Transition::Reply(Reply::text_only(text, TurnOutcome::StyleFailed)),
    }
}
