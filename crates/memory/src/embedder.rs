use types::{Embedder, MemoryError};

use crate::scoring::tokenize;

const DEFAULT_DIMENSIONS: usize = 256;

/// Feature-hashing embedder.
///
/// Each term (and each adjacent term pair) is hashed with blake3 into a
/// signed bucket; the vector is then L2-normalised. Texts sharing vocabulary
/// end up close under cosine similarity, which is enough for tests and for
/// deployments without an embedding model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = blake3::hash(feature.as_bytes());
        let bytes = hash.as_bytes();
        let bucket = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]) as usize
            % self.dimensions;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let mut vector = vec![0.0_f32; self.dimensions];
        let terms = tokenize(text);
        for term in &terms {
            self.accumulate(&mut vector, term, 1.0);
        }
        for pair in terms.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }
}
