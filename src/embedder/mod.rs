//! Embedding clients that turn change text into fixed-dimension vectors.

pub mod hash;
pub mod openai;

use anyhow::Result;
use async_trait::async_trait;

pub use hash::HashEmbedder;
pub use openai::OpenAiEmbedder;

/// Capability of computing embedding vectors for text inputs.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds a batch of inputs, returning one vector per input, in order.
    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;
}
