//! Research stage: product search plus client-side filtering.

use crate::filtering::apply_filters;
use crate::models::{Stage, StatePatch};

use super::{bounded, Orchestrator, Reply, StageFailure, StageResult, Transition, Turn, TurnOutcome};

impl Orchestrator {
    pub(super) async fn research_stage(&self, turn: &mut Turn) -> StageResult {
        let mut patch = StatePatch {
            current_stage: Some(Stage::Research),
            ..Default::default()
        };
        let query = turn.intent.clone().unwrap_or_default();
        let query_text = query.query_text().unwrap_or_default().to_string();

        let found = bounded(
            "product search",
            self.settings.search_timeout_secs,
            self.deps.search.search(&query),
        )
        .await;

        let (results, failure) = match found {
            Ok(raw) => {
                let (filtered, stats) = apply_filters(raw, &query);
                tracing::info!(
                    thread_id = %turn.thread_id,
                    input = stats.input,
                    price_filtered = stats.price_filtered,
                    rating_filtered = stats.rating_filtered,
                    output = stats.output,
                    "search results filtered"
                );
                let failure = filtered.is_empty().then_some(StageFailure::SearchEmpty);
                (filtered, failure)
            }
            Err(e) => (Vec::new(), Some(StageFailure::Search(e.to_string()))),
        };

        patch.search_results = Some(results.clone());

        if let Some(failure) = failure {
            tracing::warn!(thread_id = %turn.thread_id, error = %failure, "research found nothing");
            let text = match failure {
                StageFailure::SearchEmpty => format!(
                    "Sorry, I couldn't find any products matching \"{}\". Try broadening your \
                     search, for example by relaxing the price range, rating or brand.",
                    query_text
                ),
                _ => "Sorry, I couldn't reach the product catalog right now. Please try again \
                      in a moment."
                    .to_string(),
            };
            patch.next_stage = Some(Stage::Done);
            return StageResult {
                patch,
                transition: Transition::Reply(Reply::text_only(text, TurnOutcome::NoResults)),
            };
        }

        turn.candidates = results;
        patch.next_stage = Some(Stage::Style);
        StageResult {
            patch,
            transition: Transition::Next(Stage::Style),
        }
    }
}
