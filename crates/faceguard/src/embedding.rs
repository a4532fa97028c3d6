//! Embedding vector math: normalization, cosine similarity, centroids.
//!
//! All face embeddings in the system are 512-dimensional and L2-normalized,
//! so cosine similarity reduces to a dot product.

use crate::error::{Error, Result};

/// Dimensionality of every face embedding in the system.
pub const EMBEDDING_DIM: usize = 512;

/// Minimum single embeddings required before computing a centroid.
pub const CENTROID_MIN_EMBEDDINGS: usize = 3;

/// Cosine-similarity floor for centroid outlier rejection.
pub const CENTROID_OUTLIER_THRESHOLD: f64 = 0.50;

/// L2 norm of a vector.
#[must_use]
pub fn norm(v: &[f32]) -> f64 {
    v.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt()
}

/// L2-normalize a vector in place. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        for x in v.iter_mut() {
            *x = (f64::from(*x) / n) as f32;
        }
    }
}

/// Cosine similarity of two equal-length vectors.
///
/// # Errors
///
/// Returns an error if the vectors differ in length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(Error::Other(format!(
            "embedding length mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    let na = norm(a);
    let nb = norm(b);
    if na == 0.0 || nb == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (na * nb))
}

/// Validate that a vector is a well-formed stored embedding: 512 dimensions,
/// unit norm within tolerance.
#[must_use]
pub fn is_valid_embedding(v: &[f32]) -> bool {
    v.len() == EMBEDDING_DIM && (norm(v) - 1.0).abs() < 1e-3
}

/// Result of a centroid computation.
#[derive(Debug, Clone, PartialEq)]
pub struct Centroid {
    /// The L2-normalized centroid vector.
    pub vector: Vec<f32>,
    /// Embeddings that survived outlier rejection.
    pub embeddings_used: usize,
    /// Total single embeddings considered.
    pub embeddings_total: usize,
    /// Embeddings dropped as outliers.
    pub outliers_rejected: usize,
    /// Mean detection score of the kept embeddings.
    pub avg_detection_score: f64,
}

/// Compute a quality-weighted centroid over a contributor's single
/// embeddings.
///
/// Algorithm:
/// 1. Weighted mean with detection scores as weights (missing scores weigh
///    0.5); L2-normalize.
/// 2. Drop embeddings whose cosine similarity to that mean falls below
///    [`CENTROID_OUTLIER_THRESHOLD`] — unless that would leave fewer than
///    [`CENTROID_MIN_EMBEDDINGS`], in which case all are kept.
/// 3. Recompute the weighted mean over the kept set; L2-normalize.
///
/// Deterministic for a given set of inputs.
///
/// # Errors
///
/// Returns `None` when fewer than [`CENTROID_MIN_EMBEDDINGS`] embeddings are
/// supplied, and an error on dimension mismatches.
pub fn compute_centroid(
    embeddings: &[Vec<f32>],
    detection_scores: &[Option<f64>],
) -> Result<Option<Centroid>> {
    if embeddings.len() < CENTROID_MIN_EMBEDDINGS {
        return Ok(None);
    }
    if embeddings.len() != detection_scores.len() {
        return Err(Error::Other(
            "embedding/score count mismatch for centroid".to_string(),
        ));
    }
    let dim = embeddings[0].len();
    if embeddings.iter().any(|e| e.len() != dim) {
        return Err(Error::Other(
            "centroid inputs have mixed dimensions".to_string(),
        ));
    }

    let weights: Vec<f64> = detection_scores.iter().map(|s| s.unwrap_or(0.5)).collect();

    let mean = weighted_mean(embeddings, &weights, dim);

    // Outlier rejection against the first-pass mean. Inputs are normalized,
    // so dot product is cosine similarity.
    let mut keep: Vec<bool> = embeddings
        .iter()
        .map(|e| {
            cosine_similarity(e, &mean)
                .map(|s| s >= CENTROID_OUTLIER_THRESHOLD)
                .unwrap_or(false)
        })
        .collect();

    let mut kept = keep.iter().filter(|k| **k).count();
    let outliers_rejected = if kept < CENTROID_MIN_EMBEDDINGS {
        keep = vec![true; embeddings.len()];
        kept = embeddings.len();
        0
    } else {
        embeddings.len() - kept
    };

    let kept_embeddings: Vec<&Vec<f32>> = embeddings
        .iter()
        .zip(keep.iter())
        .filter_map(|(e, k)| k.then_some(e))
        .collect();
    let kept_weights: Vec<f64> = weights
        .iter()
        .zip(keep.iter())
        .filter_map(|(w, k)| k.then_some(*w))
        .collect();

    let mut final_vec = weighted_mean_refs(&kept_embeddings, &kept_weights, dim);
    l2_normalize(&mut final_vec);

    let avg_detection_score = kept_weights.iter().sum::<f64>() / kept_weights.len() as f64;

    Ok(Some(Centroid {
        vector: final_vec,
        embeddings_used: kept,
        embeddings_total: embeddings.len(),
        outliers_rejected,
        avg_detection_score,
    }))
}

fn weighted_mean(embeddings: &[Vec<f32>], weights: &[f64], dim: usize) -> Vec<f32> {
    let refs: Vec<&Vec<f32>> = embeddings.iter().collect();
    let mut mean = weighted_mean_refs(&refs, weights, dim);
    l2_normalize(&mut mean);
    mean
}

fn weighted_mean_refs(embeddings: &[&Vec<f32>], weights: &[f64], dim: usize) -> Vec<f32> {
    let total_weight: f64 = weights.iter().sum();
    let mut acc = vec![0.0f64; dim];
    for (e, w) in embeddings.iter().zip(weights.iter()) {
        for (a, x) in acc.iter_mut().zip(e.iter()) {
            *a += w * f64::from(*x);
        }
    }
    if total_weight > 0.0 {
        for a in acc.iter_mut() {
            *a /= total_weight;
        }
    }
    acc.into_iter().map(|x| x as f32).collect()
}
