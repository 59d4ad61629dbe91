//! Ranking stage.

use crate::models::{CandidateWithEmbedding, Stage, StatePatch};
use crate::ranking::RankingError;

use super::{Orchestrator, Reply, StageFailure, StageResult, Transition, Turn, TurnOutcome};

const MISSING_PROFILE_REPLY: &str =
    "User preference embeddings not found. Cannot rank products without user profile.";

impl Orchestrator {
    pub(super) fn ranking_stage(&self, turn: &Turn) -> StageResult {
        let mut patch = StatePatch {
            current_stage: Some(Stage::Ranking),
            next_stage: Some(Stage::Done),
            ..Default::default()
        };

        let preferences = turn
            .profile
            .as_ref()
            .and_then(|p| p.preference_embeddings.as_ref());
        let embeddings: Vec<&[f32]> = turn.styled.iter().map(|c| c.embedding.as_slice()).collect();

        let reply = match self.ranking.rank(preferences, &embeddings) {
            Ok(order) => {
                let ranked: Vec<CandidateWithEmbedding> =
                    order.into_iter().map(|i| turn.styled[i].clone()).collect();
                patch.ranked_candidates = Some(ranked.clone());
                tracing::info!(thread_id = %turn.thread_id, ranked = ranked.len(), "candidates ranked");
                Reply {
                    text: format!(
                        "I've ranked {} products based on your preferences and style. Here are \
                         the top recommendations.",
                        ranked.len()
                    ),
                    outcome: TurnOutcome::Ranked,
                    candidates: ranked,
                }
            }
            Err(RankingError::MissingProfile) => {
                tracing::warn!(
                    thread_id = %turn.thread_id,
                    user_id = %turn.user_id,
                    error = %StageFailure::MissingProfile,
                    "returning styled candidates unranked"
                );
                // The stored order is the one the user is shown.
                patch.ranked_candidates = Some(turn.styled.clone());
                Reply {
                    text: MISSING_PROFILE_REPLY.to_string(),
                    outcome: TurnOutcome::Unranked,
                    candidates: turn.styled.clone(),
                }
            }
        };

        StageResult {
            patch,
            transition: Transition::Reply(reply),
        }
    }
}
