//! Deterministic feature-hash embedder for offline runs and tests.

use anyhow::Result;
use async_trait::async_trait;

use crate::embedder::Embedder;
use crate::fingerprint;

/// Embedder that buckets hashed tokens into a fixed-dimension vector.
///
/// Produces the same vector for the same text on every call, which is all
/// the pipeline's idempotency contract needs when no model endpoint is
/// available.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    /// Creates a hash embedder emitting vectors of the given dimension.
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    /// Dimension of the produced vectors.
    pub fn dim(&self) -> usize {
        self.dim
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in tokenize(text) {
            let hashed = fingerprint::fnv1a_64(token.as_bytes());
            let bucket = (hashed as usize) % self.dim;
            let sign = if (hashed >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize_l2(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|text| self.embed_one(text)).collect())
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
}

fn normalize_l2(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_text_same_vector() {
        let embedder = HashEmbedder::new(384);
        let first = embedder.embed_batch(&["red shoes"]).await.expect("embed");
        let second = embedder.embed_batch(&["red shoes"]).await.expect("embed");
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 384);
    }

    #[tokio::test]
    async fn vectors_are_unit_length() {
        let embedder = HashEmbedder::new(64);
        let vectors = embedder
            .embed_batch(&["blue hat with a wide brim"])
            .await
            .expect("embed");
        let norm = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm was {norm}");
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let embedder = HashEmbedder::new(16);
        let vectors = embedder.embed_batch(&[""]).await.expect("embed");
        assert!(vectors[0].iter().all(|x| *x == 0.0));
    }
}
