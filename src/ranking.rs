//! Weighted multi-facet ranking of styled candidates.
//!
//! Every candidate embedding is compared against each facet of the user's
//! preference profile and against a fixed reference standard. The five
//! cosine similarities are combined with fixed weights:
//!
//! | Facet | Weight |
//! |-------|--------|
//! | style | 0.40 |
//! | brand | 0.20 |
//! | color | 0.20 |
//! | intent | 0.10 |
//! | standard | 0.10 |
//!
//! Candidates are ordered by combined score, highest first. Ties keep their
//! input order, so identical inputs always produce identical output.

use anyhow::{bail, Context, Result};
use std::cmp::Ordering;
use std::path::Path;

use crate::models::PreferenceEmbeddings;
use crate::similarity::cosine_similarity;

/// Facet weights in percent. They sum to exactly 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingWeights {
    pub style: u8,
    pub brand: u8,
    pub color: u8,
    pub intent: u8,
    pub standard: u8,
}

pub const WEIGHTS: RankingWeights = RankingWeights {
    style: 40,
    brand: 20,
    color: 20,
    intent: 10,
    standard: 10,
};

impl RankingWeights {
    pub fn total_percent(&self) -> u32 {
        self.style as u32
            + self.brand as u32
            + self.color as u32
            + self.intent as u32
            + self.standard as u32
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RankingError {
    #[error("user preference embeddings not found, cannot rank without a user profile")]
    MissingProfile,
}

/// Per-facet similarities and the weighted total for one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub style: f32,
    pub brand: f32,
    pub color: f32,
    pub intent: f32,
    pub standard: f32,
    pub total: f64,
}

#[derive(Debug, Clone)]
pub struct RankingEngine {
    standard: Vec<f32>,
}

impl RankingEngine {
    /// Engine with an explicit reference-standard vector.
    pub fn new(standard: Vec<f32>) -> Self {
        Self { standard }
    }

    /// Engine whose reference standard is the zero vector, which makes the
    /// standard facet contribute nothing.
    pub fn with_zero_standard(dims: usize) -> Self {
        Self::new(vec![0.0; dims])
    }

    /// Loads the reference standard from a JSON array of exactly `dims`
    /// finite numbers.
    pub fn from_file(path: &Path, dims: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!("Failed to read standard embedding: {}", path.display())
        })?;
        let standard: Vec<f32> = serde_json::from_str(&content).with_context(|| {
            format!("Standard embedding is not a JSON float array: {}", path.display())
        })?;
        if standard.len() != dims {
            bail!(
                "Standard embedding {} has {} dims, expected {}",
                path.display(),
                standard.len(),
                dims
            );
        }
        if standard.iter().any(|v| !v.is_finite()) {
            bail!("Standard embedding {} contains non-finite values", path.display());
        }
        Ok(Self::new(standard))
    }

    pub fn standard(&self) -> &[f32] {
        &self.standard
    }

    pub fn score(&self, profile: &PreferenceEmbeddings, embedding: &[f32]) -> ScoreBreakdown {
        let style = cosine_similarity(embedding, &profile.style);
        let brand = cosine_similarity(embedding, &profile.brand);
        let color = cosine_similarity(embedding, &profile.color);
        let intent = cosine_similarity(embedding, &profile.intent);
        let standard = cosine_similarity(embedding, &self.standard);

        let w = |pct: u8| pct as f64 / 100.0;
        let total = w(WEIGHTS.style) * style as f64
            + w(WEIGHTS.brand) * brand as f64
            + w(WEIGHTS.color) * color as f64
            + w(WEIGHTS.intent) * intent as f64
            + w(WEIGHTS.standard) * standard as f64;

        ScoreBreakdown {
            style,
            brand,
            color,
            intent,
            standard,
            total,
        }
    }

    /// Returns a permutation of `0..embeddings.len()` ordered by descending score.
    ///
    /// # Errors
    ///
    /// [`RankingError::MissingProfile`] when `profile` is `None`. Callers are
    /// expected to fall back to the unranked order themselves.
    pub fn rank<E: AsRef<[f32]>>(
        &self,
        profile: Option<&PreferenceEmbeddings>,
        embeddings: &[E],
    ) -> Result<Vec<usize>, RankingError> {
        let profile = profile.ok_or(RankingError::MissingProfile)?;

        let scores: Vec<f64> = embeddings
            .iter()
            .map(|e| self.score(profile, e.as_ref()).total)
            .collect();

        let mut order: Vec<usize> = (0..embeddings.len()).collect();
        // `sort_by` is stable, so equal scores keep input order.
        order.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(Ordering::Equal)
        });
        Ok(order)
    }
}
