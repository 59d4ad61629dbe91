//! SQLite-backed [`ConversationStore`].
//!
//! Each thread is one row of `conversation_states`. Structured fields are
//! stored as JSON text columns; timestamps are Unix milliseconds.
//!
//! An upsert reads the row, merges in Rust with [`apply_patch`], and writes
//! it back with `INSERT ... ON CONFLICT(thread_id) DO UPDATE`, all inside one
//! transaction. Upserts from this process are additionally serialized by an
//! async mutex so two turns on the same thread cannot interleave their
//! read-merge-write cycles.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::models::{ConversationState, Stage, StatePatch, ThreadSummary};

use super::{apply_patch, check_owner, messages_from_value, summarize, ConversationStore};

const SELECT_COLUMNS: &str = "thread_id, user_id, request_id, messages_json, user_profile_json, \
     extracted_query_json, search_results_json, styled_candidates_json, ranked_candidates_json, \
     current_stage, next_stage, created_at, updated_at";

pub struct SqliteConversationStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn decode_json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>> {
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() || s.trim() == "null" => Ok(None),
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .with_context(|| format!("Corrupt JSON in column {}", column)),
    }
}

fn encode_json<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(anyhow::Error::from))
        .transpose()
}

fn row_to_state(row: &SqliteRow) -> Result<ConversationState> {
    let messages_raw: Option<String> = row.try_get("messages_json")?;
    let messages = messages_raw
        .map(|raw| {
            let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
            messages_from_value(value)
        })
        .unwrap_or_default();

    let stage = |column: &str| -> Result<Option<Stage>> {
        let raw: Option<String> = row.try_get(column)?;
        Ok(raw.as_deref().and_then(Stage::parse))
    };

    Ok(ConversationState {
        thread_id: row.try_get("thread_id")?,
        user_id: row.try_get("user_id")?,
        request_id: row.try_get("request_id")?,
        messages,
        user_profile: decode_json(row, "user_profile_json")?,
        extracted_query: decode_json(row, "extracted_query_json")?,
        search_results: decode_json(row, "search_results_json")?,
        styled_candidates: decode_json(row, "styled_candidates_json")?,
        ranked_candidates: decode_json(row, "ranked_candidates_json")?,
        current_stage: stage("current_stage")?,
        next_stage: stage("next_stage")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conversation_states WHERE thread_id = ?",
            SELECT_COLUMNS
        ))
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_state).transpose()
    }

    async fn upsert(
        &self,
        thread_id: &str,
        user_id: &str,
        patch: &StatePatch,
        request_id: Option<&str>,
    ) -> Result<ConversationState> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(&format!(
            "SELECT {} FROM conversation_states WHERE thread_id = ?",
            SELECT_COLUMNS
        ))
        .bind(thread_id)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();
        let mut state = match existing {
            Some(row) => row_to_state(&row)?,
            None => ConversationState::new(thread_id, user_id, now),
        };
        check_owner(&state, user_id)?;
        let stored_count = state.messages.len();
        apply_patch(&mut state, patch, request_id, now);
        anyhow::ensure!(
            state.messages.len() >= stored_count,
            "refusing to shrink transcript of {} from {} to {} messages",
            thread_id,
            stored_count,
            state.messages.len()
        );

        sqlx::query(
            r#"
            INSERT INTO conversation_states (thread_id, user_id, request_id, messages_json,
                                             user_profile_json, extracted_query_json,
                                             search_results_json, styled_candidates_json,
                                             ranked_candidates_json, current_stage, next_stage,
                                             created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(thread_id) DO UPDATE SET
                request_id = excluded.request_id,
                messages_json = excluded.messages_json,
                user_profile_json = excluded.user_profile_json,
                extracted_query_json = excluded.extracted_query_json,
                search_results_json = excluded.search_results_json,
                styled_candidates_json = excluded.styled_candidates_json,
                ranked_candidates_json = excluded.ranked_candidates_json,
                current_stage = excluded.current_stage,
                next_stage = excluded.next_stage,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.thread_id)
        .bind(&state.user_id)
        .bind(&state.request_id)
        .bind(serde_json::to_string(&state.messages)?)
        .bind(encode_json(&state.user_profile)?)
        .bind(encode_json(&state.extracted_query)?)
        .bind(encode_json(&state.search_results)?)
        .bind(encode_json(&state.styled_candidates)?)
        .bind(encode_json(&state.ranked_candidates)?)
        .bind(state.current_stage.map(|s| s.as_str()))
        .bind(state.next_stage.map(|s| s.as_str()))
        .bind(state.created_at.timestamp_millis())
        .bind(state.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(state)
    }

    async fn delete(&self, thread_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conversation_states WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ThreadSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM conversation_states WHERE user_id = ? ORDER BY updated_at DESC",
            SELECT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_state(row) {
                Ok(state) => out.push(summarize(&state)),
                Err(e) => {
                    let thread_id: String = row.try_get("thread_id").unwrap_or_default();
                    tracing::warn!(%thread_id, error = %e, "skipping unreadable thread");
                }
            }
        }
        Ok(out)
    }
}
