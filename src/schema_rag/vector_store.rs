//! Vector Store
//!
//! Flat in-memory store of entry embeddings with exhaustive cosine search.
//! Catalogs are small (hundreds to a few thousand entries), so a linear scan
//! is exact and fast enough.

use crate::error::{BiError, Result};

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

#[derive(Debug, Clone, Default)]
pub struct InMemoryVectorStore {
    vectors: Vec<Embedding>,
    dimension: usize,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from vectors in entry order. All vectors must share one dimension.
    pub fn from_vectors(vectors: Vec<Embedding>) -> Result<Self> {
        let mut store = Self::new();
        for vector in vectors {
            store.add(vector)?;
        }
        Ok(store)
    }

    pub fn add(&mut self, vector: Embedding) -> Result<()> {
        if vector.is_empty() {
            return Err(BiError::EmbeddingService("empty embedding vector".to_string()));
        }
        if self.vectors.is_empty() {
            self.dimension = vector.len();
        } else if vector.len() != self.dimension {
            return Err(BiError::EmbeddingService(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        self.vectors.push(vector);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn vectors(&self) -> &[Embedding] {
        &self.vectors
    }

    /// Relevance of every stored vector to `query`, in storage order.
    pub fn scores(&self, query: &[f32]) -> Result<Vec<f32>> {
        if query.len() != self.dimension {
            return Err(BiError::EmbeddingService(format!(
                "query embedding has dimension {}, index has {}",
                query.len(),
                self.dimension
            )));
        }
        Ok(self.vectors.iter().map(|v| relevance(query, v)).collect())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Cosine similarity mapped into [0, 1]; opposite directions count as irrelevant.
pub fn relevance(a: &[f32], b: &[f32]) -> f32 {
    let score = cosine_similarity(a, b);
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 1.0);

        let c = vec![0.0, 1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &c), 0.0);
        assert_eq!(relevance(&a, &[-1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut store = InMemoryVectorStore::new();
        store.add(vec![1.0, 0.0]).unwrap();
        assert!(store.add(vec![1.0, 0.0, 0.0]).is_err());
        assert!(store.scores(&[1.0]).is_err());
        assert_eq!(store.scores(&[1.0, 0.0]).unwrap(), vec![1.0]);
    }
}
