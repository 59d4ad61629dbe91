//! Authoritative user records and preference enrollment.
//!
//! A thread caches a [`UserProfile`] snapshot; the directory is where that
//! snapshot comes from. The pipeline refreshes the snapshot at the start of
//! every turn, so enrolling a new photo takes effect on the next message.
//!
//! Enrollment derives the preference profile from a single photo:
//!
//! | Facet | Source |
//! |-------|--------|
//! | style | visual embedding of the photo |
//! | color | color histogram of the photo |
//! | brand, intent, face | copies of the style embedding |

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::embedding::EmbeddingGenerator;
use crate::models::{PreferenceEmbeddings, UserProfile};

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;
    async fn put_profile(&self, profile: &UserProfile) -> Result<()>;
}

/// Builds preference embeddings from one photo of the user.
pub async fn preference_embeddings_from_photo(
    generator: &EmbeddingGenerator,
    photo: &[u8],
) -> PreferenceEmbeddings {
    let style = generator.visual(photo).await;
    let color = generator.color(photo);
    PreferenceEmbeddings {
        brand: style.clone(),
        intent: style.clone(),
        face: style.clone(),
        style,
        color,
    }
}

/// Records `photo_ref` on the user's profile and recomputes their
/// preference embeddings from `photo`. Creates the user if needed.
pub async fn enroll_photo(
    directory: &dyn UserDirectory,
    generator: &EmbeddingGenerator,
    user_id: &str,
    photo_ref: &str,
    photo: &[u8],
) -> Result<UserProfile> {
    let mut profile = directory
        .get_profile(user_id)
        .await?
        .unwrap_or_else(|| UserProfile {
            user_id: user_id.to_string(),
            ..Default::default()
        });

    if !profile.photo_refs.iter().any(|r| r == photo_ref) {
        profile.photo_refs.push(photo_ref.to_string());
    }
    profile.preference_embeddings = Some(preference_embeddings_from_photo(generator, photo).await);

    directory.put_profile(&profile).await?;
    Ok(profile)
}

// ============ In-memory ============

pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<String, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let users = profiles
            .into_iter()
            .map(|p| (p.user_id.clone(), p))
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }
}

impl Default for InMemoryUserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let users = self
            .users
            .read()
            .map_err(|_| anyhow::anyhow!("user lock poisoned"))?;
        Ok(users.get(user_id).cloned())
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| anyhow::anyhow!("user lock poisoned"))?;
        users.insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }
}

// ============ SQLite ============

pub struct SqliteUserDirectory {
    pool: SqlitePool,
}

impl SqliteUserDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for SqliteUserDirectory {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT user_id, username, photo_refs_json, preference_embeddings_json, attributes_json \
             FROM users WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let photo_refs: String = row.try_get("photo_refs_json")?;
        let embeddings: Option<String> = row.try_get("preference_embeddings_json")?;
        let attributes: String = row.try_get("attributes_json")?;

        Ok(Some(UserProfile {
            user_id: row.try_get("user_id")?,
            username: row.try_get("username")?,
            photo_refs: serde_json::from_str(&photo_refs)
                .with_context(|| format!("Corrupt photo refs for user {}", user_id))?,
            preference_embeddings: embeddings
                .map(|e| serde_json::from_str(&e))
                .transpose()
                .with_context(|| format!("Corrupt preference embeddings for user {}", user_id))?,
            attributes: serde_json::from_str(&attributes).unwrap_or_default(),
        }))
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO users (user_id, username, photo_refs_json, preference_embeddings_json,
                               attributes_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                photo_refs_json = excluded.photo_refs_json,
                preference_embeddings_json = excluded.preference_embeddings_json,
                attributes_json = excluded.attributes_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.username)
        .bind(serde_json::to_string(&profile.photo_refs)?)
        .bind(
            profile
                .preference_embeddings
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&profile.attributes)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingGenerator, VisualEmbedder};
    use std::sync::Arc;
    use std::time::Duration;

    struct ConstEmbedder;

    #[async_trait]
    impl VisualEmbedder for ConstEmbedder {
        fn model_name(&self) -> &str {
            "const"
        }
        async fn embed_image(&self, _bytes: &[u8]) -> Result<Vec<f32>> {
            Ok(vec![2.0, 0.0])
        }
    }

    #[tokio::test]
    async fn enrollment_copies_style_into_other_facets() {
        let directory = InMemoryUserDirectory::new();
        let generator =
            EmbeddingGenerator::new(Arc::new(ConstEmbedder), 2, 4, Duration::from_secs(1));

        let profile = enroll_photo(&directory, &generator, "u1", "photos/u1/a.jpg", b"bytes")
            .await
            .unwrap();
        let prefs = profile.preference_embeddings.unwrap();

        assert_eq!(prefs.style, vec![1.0, 0.0]);
        assert_eq!(prefs.brand, prefs.style);
        assert_eq!(prefs.intent, prefs.style);
        assert_eq!(prefs.face, prefs.style);
        // undecodable photo bytes → zero histogram
        assert_eq!(prefs.color, vec![0.0; 4]);

        enroll_photo(&directory, &generator, "u1", "photos/u1/a.jpg", b"bytes")
            .await
            .unwrap();
        let stored = directory.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(stored.photo_refs, vec!["photos/u1/a.jpg".to_string()]);
    }
}
