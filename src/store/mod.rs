//! Durable conversation state.
//!
//! The [`ConversationStore`] trait is the only way the pipeline reads or
//! writes thread state. Backends:
//! - [`memory::InMemoryConversationStore`]: tests and single-process demos.
//! - [`sqlite::SqliteConversationStore`]: the default, one row per thread.
//!
//! Both delegate the actual field rules to [`apply_patch`], so they merge
//! identically:
//!
//! | Field | Rule |
//! |-------|------|
//! | `messages` | append unseen messages, dedup by `(normalized role, trimmed content)` |
//! | `extracted_query` | field-by-field overlay, absent values never erase |
//! | everything else | overwrite when present in the patch, untouched otherwise |
//!
//! Because message merging is idempotent, re-sending a transcript that is
//! already stored is harmless. That is what lets the pipeline persist the
//! whole turn's transcript once at the end without tracking what was saved.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::models::{ConversationState, Message, StatePatch, ThreadSummary};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Fetch the full state for a thread.
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationState>>;

    /// Merge `patch` into the thread's row, creating it if needed.
    ///
    /// Fails without writing when the thread belongs to another user.
    ///
    /// Returns the state as stored after the merge. `request_id`, when
    /// given, replaces the stored one.
    async fn upsert(
        &self,
        thread_id: &str,
        user_id: &str,
        patch: &StatePatch,
        request_id: Option<&str>,
    ) -> Result<ConversationState>;

    /// Remove a thread. Returns whether a row existed.
    async fn delete(&self, thread_id: &str) -> Result<bool>;

    /// Threads belonging to `user_id`, most recently updated first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ThreadSummary>>;
}

/// Appends each incoming message whose signature is not already present.
///
/// Stored messages are never removed or reordered; duplicates inside
/// `incoming` collapse to their first occurrence.
pub fn merge_messages(existing: &mut Vec<Message>, incoming: &[Message]) -> usize {
    let mut seen: HashSet<String> = existing.iter().map(Message::signature).collect();
    let mut added = 0;
    for msg in incoming {
        if seen.insert(msg.signature()) {
            existing.push(msg.clone());
            added += 1;
        }
    }
    added
}

/// Applies the merge rules of this module to `state` and bumps `updated_at`.
pub fn apply_patch(
    state: &mut ConversationState,
    patch: &StatePatch,
    request_id: Option<&str>,
    now: DateTime<Utc>,
) {
    merge_messages(&mut state.messages, &patch.messages);

    if let Some(rid) = request_id {
        state.request_id = Some(rid.to_string());
    }
    if let Some(profile) = &patch.user_profile {
        state.user_profile = Some(profile.clone());
    }
    if let Some(query) = &patch.extracted_query {
        match state.extracted_query.as_mut() {
            Some(stored) => stored.merge_from(query),
            None => {
                let mut fresh = crate::models::ShoppingQuery::default();
                fresh.merge_from(query);
                state.extracted_query = Some(fresh);
            }
        }
    }
    if let Some(results) = &patch.search_results {
        state.search_results = Some(results.clone());
    }
    if let Some(styled) = &patch.styled_candidates {
        state.styled_candidates = Some(styled.clone());
    }
    if let Some(ranked) = &patch.ranked_candidates {
        state.ranked_candidates = Some(ranked.clone());
    }
    if let Some(stage) = patch.current_stage {
        state.current_stage = Some(stage);
    }
    if let Some(stage) = patch.next_stage {
        state.next_stage = Some(stage);
    }

    state.updated_at = now;
}

/// Fails when `state` is owned by someone other than `user_id`.
pub fn check_owner(state: &ConversationState, user_id: &str) -> Result<()> {
    if state.user_id != user_id {
        anyhow::bail!("thread {} belongs to another user", state.thread_id);
    }
    Ok(())
}

/// Reads a stored `messages` value whatever shape it was written in.
///
/// Accepted shapes: a JSON array of messages, a JSON string containing any
/// accepted shape, an object wrapping the array as `{"messages": [...]}`,
/// a single message object, or an object keyed by position. Nothing is
/// dropped: an entry that is not a message becomes a [`Message::opaque`]
/// holding its raw text, so rewriting the transcript never shortens it.
pub fn messages_from_value(value: serde_json::Value) -> Vec<Message> {
    match value {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::Array(items) => items.into_iter().map(message_from_item).collect(),
        serde_json::Value::String(s) => match serde_json::from_str(&s) {
            Ok(inner @ (serde_json::Value::Array(_) | serde_json::Value::Object(_))) => {
                messages_from_value(inner)
            }
            _ if s.trim().is_empty() => Vec::new(),
            _ => vec![Message::opaque(&serde_json::Value::String(s))],
        },
        serde_json::Value::Object(mut map) => {
            if let Some(inner) = map.remove("messages") {
                return messages_from_value(inner);
            }
            if ["role", "type", "content"].iter().any(|k| map.contains_key(*k)) {
                return vec![message_from_item(serde_json::Value::Object(map))];
            }
            let mut entries: Vec<(String, serde_json::Value)> = map.into_iter().collect();
            entries.sort_by_key(|(k, _)| k.parse::<u64>().unwrap_or(u64::MAX));
            entries
                .into_iter()
                .map(|(_, v)| message_from_item(v))
                .collect()
        }
        other => vec![Message::opaque(&other)],
    }
}

fn message_from_item(item: serde_json::Value) -> Message {
    match serde_json::from_value::<Message>(item.clone()) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "keeping unreadable transcript entry as raw text");
            Message::opaque(&item)
        }
    }
}

/// Builds the listing entry for a state.
pub fn summarize(state: &ConversationState) -> ThreadSummary {
    ThreadSummary {
        thread_id: state.thread_id.clone(),
        message_count: state.messages.len(),
        last_message: state.messages.last().map(|m| m.content.clone()),
        current_stage: state.current_stage,
        updated_at: state.updated_at,
    }
}
