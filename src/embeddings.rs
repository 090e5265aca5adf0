//! Embedding capability and vector helpers.
//!
//! The pipeline never depends on a particular model: anything implementing
//! [`Embedder`] can be injected. [`HashEmbedder`] is the local default, a
//! signed token-hashing projection that needs no model files.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

pub const DEFAULT_DIMENSION: usize = 384;

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError>;

    /// Identifier logged alongside embedding failures.
    fn name(&self) -> &str {
        "embedder"
    }
}

/// Deterministic bag-of-tokens embedder.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        Ok(hash_embed(text, self.dimension))
    }

    fn name(&self) -> &str {
        "hash"
    }
}

fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vec = vec![0.0_f32; dimension];
    let mut seen = 0usize;

    for token in text.split(|c: char| !c.is_alphanumeric()) {
        let token = token.to_lowercase();
        if token.is_empty() {
            continue;
        }
        // sha2 rather than DefaultHasher: stored vectors must stay comparable
        // across builds.
        let digest = Sha256::digest(token.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        let hash = u64::from_le_bytes(word);
        let idx = (hash % dimension as u64) as usize;
        let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
        vec[idx] += sign;
        seen += 1;
    }

    if seen == 0 {
        return vec;
    }
    normalize(&mut vec);
    vec
}

/// Embed with a deadline. Elapsed deadlines become `PipelineError::Timeout`.
pub async fn embed_with_timeout(
    embedder: &Arc<dyn Embedder>,
    text: &str,
    timeout_secs: u64,
) -> Result<Vec<f32>, PipelineError> {
    match tokio::time::timeout(Duration::from_secs(timeout_secs), embedder.embed(text)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::timeout("embed", timeout_secs)),
    }
}

/// Scale to unit length in place. Zero vectors are left alone.
pub fn normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in values.iter_mut() {
            *value /= norm;
        }
    }
}

/// Normalized element-wise mean. Mismatched lengths keep `b`.
pub fn mean_vector(a: &[f32], b: &[f32]) -> Vec<f32> {
    if a.len() != b.len() {
        return b.to_vec();
    }
    let mut out: Vec<f32> = a.iter().zip(b).map(|(x, y)| (x + y) / 2.0).collect();
    normalize(&mut out);
    out
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (va, vb) in a.iter().zip(b.iter()) {
        dot += va * vb;
        norm_a += va * va;
        norm_b += vb * vb;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn f32_vec_to_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn blob_to_f32_vec(blob: &[u8]) -> Result<Vec<f32>, String> {
    if blob.len() % 4 != 0 {
        return Err("invalid embedding blob length".to_string());
    }

    let mut values = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        values.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(values)
}

/// Embedder that always fails. Exercises the pending-backfill path.
#[cfg(test)]
pub struct FailingEmbedder;

#[cfg(test)]
#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, PipelineError> {
        Err(PipelineError::EmbeddingUnavailable("offline".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_blob_roundtrip() {
        let original = vec![0.1_f32, -0.5_f32, 1.25_f32, 0.0_f32];
        let blob = f32_vec_to_blob(&original);
        let restored = blob_to_f32_vec(&blob).expect("valid blob");
        assert_eq!(original, restored);
        assert!(blob_to_f32_vec(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_cosine_similarity_ranking() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.9, 0.1, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("Quarterly planning review").await.expect("embed");
        let b = embedder.embed("quarterly planning, review").await.expect("embed");
        assert_eq!(a.len(), DEFAULT_DIMENSION);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);

        let c = embedder.embed("lunch with the design team").await.expect("embed");
        assert!(cosine_similarity(&a, &c) < 0.5);
    }

    #[test]
    fn test_mean_vector_is_unit_length() {
        let merged = mean_vector(&[1.0, 0.0], &[0.0, 1.0]);
        let norm = merged.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_failing_embedder_surfaces_error() {
        let embedder: Arc<dyn Embedder> = Arc::new(FailingEmbedder);
        let err = embed_with_timeout(&embedder, "x", 1)
            .await
            .expect_err("should fail");
        assert!(err.is_retryable());
    }
}
