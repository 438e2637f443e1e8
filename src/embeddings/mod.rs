// src/embeddings/mod.rs
// Embedding provider module

mod ollama;

pub use self::ollama::OllamaEmbedder;

use anyhow::Result;
use async_trait::async_trait;

/// Text-to-vector encoder used by the memory layer.
///
/// Implementations must be safe for concurrent use; the memory component is
/// shared across every ingress.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embedding dimensionality, matching the vector collection
    fn dimensions(&self) -> u64;

    /// Encode one text into a vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
