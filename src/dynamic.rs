//! Append-only vocabulary for embedders without a fixed word list.
//!
//! Tokens are embedded the first time they are seen and the vector is kept
//! for every later lookup. Slot 0 is the zero vector, as in
//! [`VocabularyTable`](crate::vocab::VocabularyTable).

use std::collections::HashMap;

use headwater::EmbedderError;

use crate::common::{EmbeddingError, PADDING_IDX, Result, UNKNOWN_TOKEN, VocabIdx};

#[derive(Debug, Clone)]
pub struct DynamicVocabulary {
    word2idx: HashMap<String, VocabIdx>,
    vectors: Vec<f32>,
    embedding_dim: usize,
}

impl DynamicVocabulary {
    /// An empty store holding only the zero slot. `embedding_dim` must be positive.
    pub fn new(embedding_dim: usize) -> Result<Self> {
        if embedding_dim == 0 {
            return Err(EmbeddingError::ZeroDimension);
        }
        let mut word2idx = HashMap::new();
        word2idx.insert(UNKNOWN_TOKEN.to_string(), PADDING_IDX);
        Ok(Self {
            word2idx,
            vectors: vec![0.0; embedding_dim],
            embedding_dim,
        })
    }

    /// Return the slot of `token`, calling `embed` to fill a new slot if it has none.
    ///
    /// `embed` runs at most once per distinct token. Its error is returned
    /// unchanged and nothing is inserted; a vector of the wrong dimension is
    /// rejected the same way.
    pub fn get_or_insert<F>(&mut self, token: &str, embed: F) -> Result<VocabIdx>
    where
        F: FnOnce(&str) -> std::result::Result<Vec<f32>, EmbedderError>,
    {
        if let Some(&idx) = self.word2idx.get(token) {
            return Ok(idx);
        }

        let vector = embed(token)?;
        if vector.len() != self.embedding_dim {
            return Err(EmbeddingError::DimensionMismatch {
                token: token.to_string(),
                expected: self.embedding_dim,
                actual: vector.len(),
            });
        }

        let idx = VocabIdx(self.num_embeddings() as u32);
        self.vectors.extend_from_slice(&vector);
        self.word2idx.insert(token.to_string(), idx);
        Ok(idx)
    }

    pub fn index(&self, token: &str) -> Option<VocabIdx> {
        self.word2idx.get(token).copied()
    }

    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn get(&self, idx: VocabIdx) -> &[f32] {
        let start = idx.as_usize() * self.embedding_dim;
        &self.vectors[start..start + self.embedding_dim]
    }

    /// All stored vectors, row-major in slot order.
    pub fn as_slice(&self) -> &[f32] {
        &self.vectors
    }

    /// Number of slots, including the zero slot.
    pub fn num_embeddings(&self) -> usize {
        self.vectors.len() / self.embedding_dim
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}
