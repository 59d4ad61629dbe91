//! SQLite store and user directory against a real database file.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;

use tryon_stylist::config::load_config;
use tryon_stylist::models::{Message, PreferenceEmbeddings, ShoppingQuery, Stage, StatePatch, UserProfile};
use tryon_stylist::store::sqlite::SqliteConversationStore;
use tryon_stylist::store::ConversationStore;
use tryon_stylist::users::{SqliteUserDirectory, UserDirectory};
use tryon_stylist::{db, migrate};

async fn setup() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config_path: PathBuf = tmp.path().join("stylist.toml");
    fs::write(
        &config_path,
        format!("[db]\npath = \"{}/data/stylist.sqlite\"\n", tmp.path().display()),
    )
    .unwrap();

    let config = load_config(&config_path).unwrap();
    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    (tmp, pool)
}

#[tokio::test]
async fn upsert_merges_messages_and_keeps_fields() {
    let (_tmp, pool) = setup().await;
    let store = SqliteConversationStore::new(pool);

    let first = StatePatch {
        messages: vec![Message::human("a red kurta"), Message::ai("Looking...")],
        extracted_query: Some(ShoppingQuery {
            query: Some("kurta".into()),
            color: Some("red".into()),
            ..Default::default()
        }),
        current_stage: Some(Stage::Context),
        next_stage: Some(Stage::Research),
        ..Default::default()
    };
    store.upsert("t1", "u1", &first, Some("req_1")).await.unwrap();

    // Re-sent messages dedup; only the new one is appended.
    let second = StatePatch {
        messages: vec![
            Message::human("  a red kurta "),
            Message::ai("Looking..."),
            Message::human("under 2000"),
        ],
        extracted_query: Some(ShoppingQuery {
            max_price: Some(2000.0),
            ..Default::default()
        }),
        ..Default::default()
    };
    let stored = store.upsert("t1", "u1", &second, Some("req_2")).await.unwrap();
    assert_eq!(stored.messages.len(), 3);

    let state = store.get("t1").await.unwrap().unwrap();
    assert_eq!(state.messages.len(), 3);
    assert_eq!(state.messages[2].content, "under 2000");
    assert_eq!(state.request_id.as_deref(), Some("req_2"));
    // Stages were absent from the second patch.
    assert_eq!(state.current_stage, Some(Stage::Context));
    assert_eq!(state.next_stage, Some(Stage::Research));

    let q = state.extracted_query.unwrap();
    assert_eq!(q.query.as_deref(), Some("kurta"));
    assert_eq!(q.color.as_deref(), Some("red"));
    assert_eq!(q.max_price, Some(2000.0));
    assert!(state.created_at <= state.updated_at);
}

#[tokio::test]
async fn missing_thread_is_none_and_delete_reports_it() {
    let (_tmp, pool) = setup().await;
    let store = SqliteConversationStore::new(pool);

    assert!(store.get("nope").await.unwrap().is_none());
    assert!(!store.delete("nope").await.unwrap());

    store
        .upsert("t1", "u1", &StatePatch::default(), None)
        .await
        .unwrap();
    assert!(store.delete("t1").await.unwrap());
    assert!(store.get("t1").await.unwrap().is_none());
}

async fn set_raw_messages(pool: &SqlitePool, thread_id: &str, raw: &str) {
    sqlx::query("UPDATE conversation_states SET messages_json = ? WHERE thread_id = ?")
        .bind(raw)
        .bind(thread_id)
        .execute(pool)
        .await
        .unwrap();
}

async fn raw_messages(pool: &SqlitePool, thread_id: &str) -> serde_json::Value {
    let raw: String =
        sqlx::query_scalar("SELECT messages_json FROM conversation_states WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_one(pool)
            .await
            .unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn reply(text: &str) -> StatePatch {
    StatePatch {
        messages: vec![Message::ai(text)],
        ..Default::default()
    }
}

#[tokio::test]
async fn legacy_message_shapes_are_read() {
    let (_tmp, pool) = setup().await;
    let store = SqliteConversationStore::new(pool.clone());
    store
        .upsert("t1", "u1", &StatePatch::default(), None)
        .await
        .unwrap();

    // A double-encoded transcript written by an older client.
    let legacy = json!([{"type": "human", "content": "hi"}, {"type": "ai", "content": "hello"}]);
    set_raw_messages(&pool, "t1", &serde_json::to_string(&legacy.to_string()).unwrap()).await;
    let state = store.get("t1").await.unwrap().unwrap();
    assert_eq!(state.messages.len(), 2);
    assert!(state.messages[0].is_human());
}

#[tokio::test]
async fn upsert_over_odd_shaped_transcript_keeps_every_entry() {
    let (_tmp, pool) = setup().await;
    let store = SqliteConversationStore::new(pool.clone());
    store
        .upsert("t1", "u1", &StatePatch::default(), None)
        .await
        .unwrap();

    let legacy = json!([
        {"type": "human", "content": [{"type": "text", "text": "a red kurta"}]},
        {"type": "ai", "role": "assistant", "content": "Which size?", "additional_kwargs": {}},
        {"role": "human", "content": "M"},
    ]);
    set_raw_messages(&pool, "t1", &legacy.to_string()).await;

    let before = store.get("t1").await.unwrap().unwrap();
    assert_eq!(before.messages.len(), 3);
    assert_eq!(before.messages[0].content, "a red kurta");
    assert_eq!(before.messages[1].content, "Which size?");

    store.upsert("t1", "u1", &reply("done"), None).await.unwrap();

    let raw = raw_messages(&pool, "t1").await;
    let entries = raw.as_array().unwrap();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0]["content"], "a red kurta");
    assert_eq!(entries[1]["role"], "assistant");
    assert_eq!(entries[3]["content"], "done");
}

#[tokio::test]
async fn unparseable_transcript_survives_a_rewrite() {
    let (_tmp, pool) = setup().await;
    let store = SqliteConversationStore::new(pool.clone());
    store
        .upsert("t1", "u1", &StatePatch::default(), None)
        .await
        .unwrap();
    set_raw_messages(&pool, "t1", "{{not json").await;

    let state = store.get("t1").await.unwrap().unwrap();
    assert_eq!(state.messages.len(), 1);

    store.upsert("t1", "u1", &reply("done"), None).await.unwrap();

    let raw = raw_messages(&pool, "t1").await;
    let entries = raw.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["content"], "{{not json");
    assert_eq!(entries[1]["content"], "done");
}

#[tokio::test]
async fn upsert_refuses_another_users_thread() {
    let (_tmp, pool) = setup().await;
    let store = SqliteConversationStore::new(pool);
    store.upsert("t1", "u1", &reply("hello"), None).await.unwrap();

    let err = store
        .upsert("t1", "intruder", &reply("taken"), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("belongs to another user"));

    let state = store.get("t1").await.unwrap().unwrap();
    assert_eq!(state.user_id, "u1");
    assert_eq!(state.messages.len(), 1);
}

#[tokio::test]
async fn concurrent_upserts_lose_no_messages() {
    let (_tmp, pool) = setup().await;
    let store = std::sync::Arc::new(SqliteConversationStore::new(pool));

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let patch = StatePatch {
                messages: vec![Message::human(format!("message {}", i))],
                ..Default::default()
            };
            store.upsert("t1", "u1", &patch, None).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let state = store.get("t1").await.unwrap().unwrap();
    assert_eq!(state.messages.len(), 8);
}

#[tokio::test]
async fn threads_are_listed_newest_first() {
    let (_tmp, pool) = setup().await;
    let store = SqliteConversationStore::new(pool);

    for (thread, text) in [("t1", "first"), ("t2", "second")] {
        let patch = StatePatch {
            messages: vec![Message::human(text)],
            ..Default::default()
        };
        store.upsert(thread, "u1", &patch, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    store
        .upsert("t3", "someone-else", &StatePatch::default(), None)
        .await
        .unwrap();

    let threads = store.list_for_user("u1").await.unwrap();
    assert_eq!(threads.len(), 2);
    assert_eq!(threads[0].thread_id, "t2");
    assert_eq!(threads[0].last_message.as_deref(), Some("second"));
    assert_eq!(threads[1].message_count, 1);
}

#[tokio::test]
async fn user_profiles_round_trip() {
    let (_tmp, pool) = setup().await;
    let users = SqliteUserDirectory::new(pool);

    assert!(users.get_profile("u1").await.unwrap().is_none());

    let mut profile = UserProfile {
        user_id: "u1".into(),
        username: Some("asha".into()),
        photo_refs: vec!["photos/u1/a.png".into()],
        preference_embeddings: None,
        attributes: Default::default(),
    };
    users.put_profile(&profile).await.unwrap();
    let loaded = users.get_profile("u1").await.unwrap().unwrap();
    assert_eq!(loaded, profile);

    profile.preference_embeddings = Some(PreferenceEmbeddings {
        style: vec![1.0, 0.0],
        brand: vec![1.0, 0.0],
        color: vec![0.5],
        intent: vec![1.0, 0.0],
        face: vec![],
    });
    profile
        .attributes
        .insert("skin_tone".into(), json!("medium"));
    users.put_profile(&profile).await.unwrap();
    let loaded = users.get_profile("u1").await.unwrap().unwrap();
    assert_eq!(loaded, profile);
}
