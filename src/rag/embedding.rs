//! Embedding seam.
//!
//! Stores and retrievers never compute vectors themselves; they call an
//! [`Embedder`]. Production deployments wrap a model endpoint, tests
//! inject a deterministic fake.

use async_trait::async_trait;

use crate::model::client::ModelError;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;

    /// Embed a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors.pop().ok_or_else(|| ModelError::InvalidResponse {
            message: "embedder returned no vector".to_string(),
        })
    }
}

/// Cosine similarity of two vectors; 0 for mismatched or zero-length input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Map an L2 distance over normalized vectors into a [0, 1] similarity.
pub fn l2_distance_to_similarity(distance: f32) -> f32 {
    (1.0 - distance / std::f32::consts::SQRT_2).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.6, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn l2_mapping_is_clamped() {
        assert_eq!(l2_distance_to_similarity(0.0), 1.0);
        assert_eq!(l2_distance_to_similarity(10.0), 0.0);
        let mid = l2_distance_to_similarity(0.7);
        assert!(mid > 0.0 && mid < 1.0);
    }
}
