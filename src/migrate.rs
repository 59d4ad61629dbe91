//! Schema creation. Every statement is idempotent so `stylist init` can be
//! re-run safely, and `serve` runs it on startup.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates all tables and indexes on an already-open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // One row per thread. Every state field is an independently nullable
    // JSON document; `messages` is never NULL.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_states (
            thread_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            request_id TEXT,
            messages_json TEXT NOT NULL DEFAULT '[]',
            user_profile_json TEXT,
            extracted_query_json TEXT,
            search_results_json TEXT,
            styled_candidates_json TEXT,
            ranked_candidates_json TEXT,
            current_stage TEXT,
            next_stage TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            username TEXT,
            photo_refs_json TEXT NOT NULL DEFAULT '[]',
            preference_embeddings_json TEXT,
            attributes_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversation_states_user ON conversation_states(user_id, updated_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
