//! Context and clarification stages.

use crate::models::{Stage, StatePatch};

use super::{
    bounded, ClarifyReason, Orchestrator, Reply, StageFailure, StageResult, Transition, Turn,
    TurnOutcome,
};

const NOT_SHOPPING_REPLY: &str = "I'm your shopping assistant, so I can only help with \
    finding and trying on products. Tell me what you'd like to shop for, for example \
    \"a red cotton kurta under 2000\".";

impl Orchestrator {
    /// Gates on shopping intent, then extracts and merges the structured query.
    pub(super) async fn context_stage(&self, turn: &mut Turn) -> StageResult {
        let mut patch = StatePatch {
            user_profile: turn.profile.clone(),
            current_stage: Some(Stage::Context),
            ..Default::default()
        };
        let timeout = self.settings.extraction_timeout_secs;

        match bounded(
            "intent check",
            timeout,
            self.deps.extractor.classify(&turn.transcript),
        )
        .await
        {
            Ok(check) if !check.is_shopping_related => {
                let text = check
                    .response_if_not_related
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| NOT_SHOPPING_REPLY.to_string());
                patch.next_stage = Some(Stage::Done);
                return StageResult {
                    patch,
                    transition: Transition::Reply(Reply::text_only(text, TurnOutcome::NotShopping)),
                };
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(thread_id = %turn.thread_id, error = %e, "intent check failed, assuming shopping");
            }
        }

        let extracted = match bounded(
            "intent extraction",
            timeout,
            self.deps.extractor.extract(&turn.transcript),
        )
        .await
        {
            Ok(q) => q,
            Err(e) => {
                let failure = StageFailure::Extraction(e.to_string());
                tracing::warn!(thread_id = %turn.thread_id, error = %failure, "routing to clarification");
                turn.clarify_reason = ClarifyReason::ExtractionFailed;
                patch.next_stage = Some(Stage::Clarification);
                return StageResult {
                    patch,
                    transition: Transition::Next(Stage::Clarification),
                };
            }
        };

        let mut merged = turn.intent.take().unwrap_or_default();
        merged.merge_from(&extracted);
        patch.extracted_query = Some(extracted);

        let next = if merged.query_text().is_some() {
            Stage::Research
        } else {
            turn.clarify_reason = ClarifyReason::MissingQuery;
            Stage::Clarification
        };
        tracing::info!(
            thread_id = %turn.thread_id,
            query = merged.query_text().unwrap_or(""),
            next = next.as_str(),
            "intent extracted"
        );
        turn.intent = Some(merged);
        patch.next_stage = Some(next);
        StageResult {
            patch,
            transition: Transition::Next(next),
        }
    }

    /// Asks the user for whatever the context stage could not determine.
    pub(super) fn clarification_stage(&self, turn: &Turn) -> StageResult {
        let text = match turn.clarify_reason {
            ClarifyReason::ExtractionFailed => "Sorry, I couldn't quite follow that. Could you \
                describe the product you're looking for, along with any preferences like color, \
                brand, size or budget?"
                .to_string(),
            ClarifyReason::MissingQuery => clarifying_question(turn),
        };
        StageResult {
            patch: StatePatch {
                current_stage: Some(Stage::Clarification),
                next_stage: Some(Stage::Context),
                ..Default::default()
            },
            transition: Transition::Reply(Reply::text_only(text, TurnOutcome::Clarify)),
        }
    }
}

/// Builds the question, echoing back any preferences already known.
fn clarifying_question(turn: &Turn) -> String {
    let mut known = Vec::new();
    if let Some(q) = &turn.intent {
        for (label, value) in [
            ("color", &q.color),
            ("brand", &q.brand),
            ("size", &q.size),
            ("material", &q.material),
        ] {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                known.push(format!("{} {}", label, v));
            }
        }
        if let Some(max) = q.max_price {
            known.push(format!("budget up to {}", max));
        }
    }

    let mut text = String::from(
        "To generate the best recommendations, I need to know the type of product you're \
         looking for (for example a dress, sneakers or a jacket).",
    );
    if !known.is_empty() {
        text.push_str(&format!(" So far I have: {}.", known.join(", ")));
    }
    text.push_str(" What would you like to shop for?");
    text
}
