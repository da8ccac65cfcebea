// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Embedding generation abstraction.
//!
//! The core never talks to a model provider directly - it calls
//! [`EmbeddingGenerator`] and treats the call as a suspension point.
//! [`HashEmbeddings`] is the deterministic local implementation used by
//! tests and migrations; real deployments inject their own generator.

use async_trait::async_trait;

use crate::error::Result;

/// Abstracted embedding generation. The single extension point for turning
/// content into vectors.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch. The default loops over [`EmbeddingGenerator::embed`];
    /// override when the backing service supports batching.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Output dimension.
    fn dimension(&self) -> usize;
}

/// Deterministic hash-based embeddings.
///
/// Produces a unit-length vector derived only from the input bytes, so the
/// same text always embeds identically. No semantic meaning - useful for
/// tests, migrations, and environments without a model provider.
#[derive(Debug, Clone)]
pub struct HashEmbeddings {
    dimension: usize,
}

impl HashEmbeddings {
    /// Create a generator with the given output dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        // FNV-1a per dimension with a per-dimension seed keeps the output
        // stable across runs and platforms.
        let mut v: Vec<f32> = (0..self.dimension)
            .map(|dim| {
                let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ (dim as u64).wrapping_mul(31);
                for byte in text.as_bytes() {
                    hash ^= u64::from(*byte);
                    hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
                }
                // Map to (-1, 1).
                (hash as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32
            })
            .collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingGenerator for HashEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
