//! In-memory [`ConversationStore`] for tests and throwaway sessions.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Upserts hold the write lock
//! for the whole merge, so concurrent turns serialize per store.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{ConversationState, StatePatch, ThreadSummary};

use super::{apply_patch, check_owner, summarize, ConversationStore};

pub struct InMemoryConversationStore {
    states: RwLock<HashMap<String, ConversationState>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.states.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        let states = self
            .states
            .read()
            .map_err(|_| anyhow::anyhow!("state lock poisoned"))?;
        Ok(states.get(thread_id).cloned())
    }

    async fn upsert(
        &self,
        thread_id: &str,
        user_id: &str,
        patch: &StatePatch,
        request_id: Option<&str>,
    ) -> Result<ConversationState> {
        let now = Utc::now();
        let mut states = self
            .states
            .write()
            .map_err(|_| anyhow::anyhow!("state lock poisoned"))?;
        let state = states
            .entry(thread_id.to_string())
            .or_insert_with(|| ConversationState::new(thread_id, user_id, now));
        check_owner(state, user_id)?;
        apply_patch(state, patch, request_id, now);
        Ok(state.clone())
    }

    async fn delete(&self, thread_id: &str) -> Result<bool> {
        let mut states = self
            .states
            .write()
            .map_err(|_| anyhow::anyhow!("state lock poisoned"))?;
        Ok(states.remove(thread_id).is_some())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ThreadSummary>> {
        let states = self
            .states
            .read()
            .map_err(|_| anyhow::anyhow!("state lock poisoned"))?;
        let mut out: Vec<ThreadSummary> = states
            .values()
            .filter(|s| s.user_id == user_id)
            .map(summarize)
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    #[tokio::test]
    async fn upsert_creates_then_merges() {
        let store = InMemoryConversationStore::new();
        let patch = StatePatch {
            messages: vec![Message::human("hello")],
            ..Default::default()
        };
        let first = store.upsert("t", "u", &patch, Some("req_1")).await.unwrap();
        assert_eq!(first.created_at, first.updated_at);

        let second = store.upsert("t", "u", &patch, None).await.unwrap();
        assert_eq!(second.messages.len(), 1);
        assert_eq!(second.request_id.as_deref(), Some("req_1"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = InMemoryConversationStore::new();
        store
            .upsert("t", "u", &StatePatch::default(), None)
            .await
            .unwrap();
        assert!(store.delete("t").await.unwrap());
        assert!(!store.delete("t").await.unwrap());
        assert!(store.get("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_rejects_another_users_thread() {
        let store = InMemoryConversationStore::new();
        store
            .upsert("t", "u1", &StatePatch::default(), None)
            .await
            .unwrap();
        let patch = StatePatch {
            messages: vec![Message::human("mine now")],
            ..Default::default()
        };
        let err = store.upsert("t", "u2", &patch, None).await.unwrap_err();
        assert!(err.to_string().contains("belongs to another user"));
        assert!(store.get("t").await.unwrap().unwrap().messages.is_empty());
    }
}
