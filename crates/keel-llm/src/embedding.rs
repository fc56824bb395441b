use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::provider::ProviderError;

/// Text-embedding provider interface.
///
/// Real backends (remote embedding APIs) live outside the core; the engine is
/// written against this trait only.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Embedding dimensionality every vector from this provider has.
    fn dimensions(&self) -> usize;

    async fn embed_single(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed_single(t).await?);
        }
        Ok(out)
    }
}

/// Deterministic embedding provider for tests and embedded use.
///
/// Vectors are seeded from a SHA-256 of the text and L2-normalised, so equal
/// texts always embed identically across processes while distinct texts land
/// far apart.
pub struct MockEmbeddingProvider {
    dimensions: usize,
}

impl MockEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dimensions);
        let mut counter: u32 = 0;
        let mut block = [0u8; 32];
        while values.len() < self.dimensions {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            block.copy_from_slice(&hasher.finalize());
            for chunk in block.chunks_exact(4) {
                if values.len() == self.dimensions {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map to [-1, 1].
                values.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }

        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        values
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_single(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.vector_for(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_text_identical_vector() {
        let p = MockEmbeddingProvider::new(64);
        let a = p.embed_single("check my balance").await.unwrap();
        let b = p.embed_single("check my balance").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn vectors_are_unit_length() {
        let p = MockEmbeddingProvider::new(128);
        let v = p.embed_single("hello").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn different_texts_differ() {
        let p = MockEmbeddingProvider::new(64);
        let a = p.embed_single("alpha").await.unwrap();
        let b = p.embed_single("beta").await.unwrap();
        assert_ne!(a, b);
    }
}
