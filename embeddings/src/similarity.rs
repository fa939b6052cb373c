//! Similarity computation for embeddings.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EmbeddingError, Result};

/// Compute the cosine similarity between two embeddings.
///
/// Returns a value between -1.0 and 1.0. A zero-magnitude operand scores 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot_product / (magnitude_a * magnitude_b))
}

/// A similarity search hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    /// ID of the matched record.
    pub id: Uuid,

    /// Cosine similarity to the query.
    pub score: f32,
}

/// Rank `candidates` against `query`, keeping the best `k` at or above
/// `min_score`. Ties keep candidate order.
pub fn find_top_k<'a, I>(
    query: &[f32],
    candidates: I,
    k: usize,
    min_score: f32,
) -> Result<Vec<SimilarityResult>>
where
    I: IntoIterator<Item = (Uuid, &'a [f32])>,
{
    let mut scores: Vec<(OrderedFloat<f32>, Uuid)> = Vec::new();

    for (id, embedding) in candidates {
        let score = cosine_similarity(query, embedding)?;
        if score >= min_score {
            scores.push((OrderedFloat(score), id));
        }
    }

    // Sort by score descending
    scores.sort_by_key(|(score, _)| std::cmp::Reverse(*score));

    Ok(scores
        .into_iter()
        .take(k)
        .map(|(score, id)| SimilarityResult { id, score: score.0 })
        .collect())
}
