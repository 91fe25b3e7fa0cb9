use memefeed_core::{CoreError, Embedding, EmbeddingError, ReactionInput};

use crate::WeightTable;

/// A reaction that carries signal: non-zero weight and a post embedding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedVector<'a> {
    pub weight: f64,
    pub vector: &'a [f64],
}

/// Resolves weights for `inputs` and drops every row that cannot contribute:
/// posts without an embedding and kinds weighing 0.0 (unknown kinds included).
pub fn contributing<'a>(inputs: &'a [ReactionInput], weights: &WeightTable) -> Vec<WeightedVector<'a>> {
    inputs
        .iter()
        .filter_map(|input| {
            let vector = input.embedding.as_deref().filter(|v| !v.is_empty())?;
            let weight = weights.weight(&input.kind);
            (weight != 0.0).then_some(WeightedVector { weight, vector })
        })
        .collect()
}

/// Signed weighted mean of `vectors` scaled to unit length.
///
/// The normaliser is `Σ|w|`, so a negative weight keeps its magnitude in the
/// denominator while pushing the mean away from its vector. Returns `None`
/// when there is no signal: no vectors, zero total weight, or a mean that
/// cancels out to the zero vector.
///
/// When `expected_dim` is given every vector must have that length; otherwise
/// all vectors must match the first one.
pub fn weighted_mean_normalized(
    vectors: &[WeightedVector<'_>],
    expected_dim: Option<usize>,
) -> Result<Option<Embedding>, CoreError> {
    let Some(first) = vectors.first() else {
        return Ok(None);
    };
    let dimensions = expected_dim.unwrap_or(first.vector.len());

    let mut agg = vec![0.0_f64; dimensions];
    let mut total_weight = 0.0_f64;

    for item in vectors {
        if item.weight == 0.0 {
            continue;
        }
        if item.vector.len() != dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimensions,
                actual: item.vector.len(),
            }
            .into());
        }

        total_weight += item.weight.abs();
        for (slot, value) in agg.iter_mut().zip(item.vector) {
            *slot += item.weight * value;
        }
    }

    if total_weight == 0.0 {
        return Ok(None);
    }

    let avg: Vec<f64> = agg.into_iter().map(|v| v / total_weight).collect();

    let norm = avg.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm == 0.0 {
        return Ok(None);
    }

    Ok(Some(avg.into_iter().map(|x| x / norm).collect()))
}

pub fn euclidean_norm(vector: &[f64]) -> f64 {
    vector.iter().map(|x| x * x).sum::<f64>().sqrt()
}
