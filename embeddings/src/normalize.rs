//! Dimension normalization.
//!
//! Every stored embedding is mapped onto one standard dimension so that
//! cosine similarity stays meaningful across records produced by different
//! models. Shorter vectors are zero-padded, longer vectors are reduced by
//! averaging contiguous groups, and the result is scaled to unit length.

use tracing::trace;

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Vectors whose norm is already this close to 1.0 are not rescaled.
const UNIT_NORM_TOLERANCE: f64 = 1e-6;

/// Map `vector` from `from_dim` to `to_dim` components.
///
/// - equal dimensions: a copy is returned, scaled to unit L2 length unless
///   it already is (within tolerance), in which case it is left unmodified
/// - `from_dim < to_dim`: zero components are appended, then the vector is
///   scaled to unit L2 length
/// - `from_dim > to_dim`: the source is split into `to_dim` contiguous groups
///   of `ceil(from_dim / to_dim)` components (the last group may be shorter),
///   each group is replaced by its mean, then the vector is scaled to unit
///   L2 length
///
/// A zero-magnitude input is rejected with [`EmbeddingError::ZeroVector`] on
/// every path.
pub fn normalize_dimensions(vector: &[f32], from_dim: usize, to_dim: usize) -> Result<Embedding> {
    if from_dim == 0 || to_dim == 0 {
        return Err(EmbeddingError::InvalidDimension { from_dim, to_dim });
    }
    if vector.len() != from_dim {
        return Err(EmbeddingError::DimensionMismatch {
            expected: from_dim,
            actual: vector.len(),
        });
    }
    if magnitude(vector) == 0.0 {
        return Err(EmbeddingError::ZeroVector);
    }

    if from_dim == to_dim {
        let mut copy = vector.to_vec();
        l2_normalize(&mut copy)?;
        return Ok(copy);
    }

    let mut widened: Vec<f64> = if from_dim < to_dim {
        trace!("Padding embedding from {from_dim} to {to_dim} dimensions");
        let mut padded: Vec<f64> = vector.iter().map(|&x| f64::from(x)).collect();
        padded.resize(to_dim, 0.0);
        padded
    } else {
        trace!("Reducing embedding from {from_dim} to {to_dim} dimensions");
        reduce_by_group_mean(vector, to_dim)
    };

    scale_to_unit(&mut widened)?;
    Ok(widened.into_iter().map(|x| x as f32).collect())
}

/// Scale an embedding in place to unit L2 length.
pub fn l2_normalize(vector: &mut [f32]) -> Result<()> {
    let norm = magnitude(vector);
    if norm == 0.0 {
        return Err(EmbeddingError::ZeroVector);
    }
    if (norm - 1.0).abs() <= UNIT_NORM_TOLERANCE {
        return Ok(());
    }
    for x in vector.iter_mut() {
        *x = (f64::from(*x) / norm) as f32;
    }
    Ok(())
}

/// Normalizer bound to a deployment's standard dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionNormalizer {
    standard_dimension: usize,
}

impl DimensionNormalizer {
    /// Create a normalizer targeting `standard_dimension`.
    pub fn new(standard_dimension: usize) -> Result<Self> {
        if standard_dimension == 0 {
            return Err(EmbeddingError::InvalidDimension {
                from_dim: 0,
                to_dim: standard_dimension,
            });
        }
        Ok(Self { standard_dimension })
    }

    /// The dimension every output vector has.
    pub fn standard_dimension(&self) -> usize {
        self.standard_dimension
    }

    /// Normalize a provider vector to the standard dimension.
    pub fn normalize(&self, vector: &[f32]) -> Result<Embedding> {
        normalize_dimensions(vector, vector.len(), self.standard_dimension)
    }
}

impl Default for DimensionNormalizer {
    fn default() -> Self {
        Self {
            standard_dimension: crate::STANDARD_DIMENSION,
        }
    }
}

fn magnitude(vector: &[f32]) -> f64 {
    vector
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt()
}

/// Group means over `ceil(len / to_dim)`-sized chunks. When the chunking runs
/// out of source components before `to_dim` groups are formed, the remaining
/// slots are zero.
fn reduce_by_group_mean(vector: &[f32], to_dim: usize) -> Vec<f64> {
    let group_size = vector.len().div_ceil(to_dim);
    let mut reduced: Vec<f64> = vector
        .chunks(group_size)
        .map(|group| group.iter().map(|&x| f64::from(x)).sum::<f64>() / group.len() as f64)
        .collect();
    reduced.resize(to_dim, 0.0);
    reduced
}

fn scale_to_unit(vector: &mut [f64]) -> Result<()> {
    let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm == 0.0 {
        // Group means can cancel out even when the source was non-zero.
        return Err(EmbeddingError::ZeroVector);
    }
    if (norm - 1.0).abs() <= UNIT_NORM_TOLERANCE {
        return Ok(());
    }
    for x in vector.iter_mut() {
        *x /= norm;
    }
    Ok(())
}
