//! Common types and constants used throughout the embedding layer.

use std::path::PathBuf;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token stored at [`PADDING_IDX`] in every vocabulary.
pub const UNKNOWN_TOKEN: &str = "<unknown>";

/// Reserved index for unknown tokens and padding positions. Always maps to the zero vector.
pub const PADDING_IDX: VocabIdx = VocabIdx(0);

// ============================================================================
// Index NewTypes
// ============================================================================

/// Row index into an embedding matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VocabIdx(pub u32);

impl VocabIdx {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("failed to read vocabulary file {path}: {source}")]
    VocabIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("vocabulary source {source_name} has no vectors of dimension {dim}")]
    EmptyVocabulary { source_name: String, dim: usize },

    #[error("vector for {token:?} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        token: String,
        expected: usize,
        actual: usize,
    },

    #[error("embedding dimension must be greater than zero")]
    ZeroDimension,

    #[error("cannot embed an empty batch")]
    EmptyBatch,

    #[error("schema {0} in the batch has no columns")]
    EmptySchema(usize),

    #[error("token {0:?} contains no embeddable words")]
    EmptyToken(String),

    #[error(transparent)]
    External(#[from] headwater::EmbedderError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("failed to serialize cache key: {0}")]
    CacheKey(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;

// ============================================================================
// Batch Outputs
// ============================================================================

/// A padded batch and the true length of every item.
///
/// `embed` produces `[batch, max_len, dim]` (or `[batch, dim]` when the
/// sequence was averaged away); `embed_history` produces
/// `[batch, max_history_len, dim]`. Positions at or beyond `lengths[i]` hold
/// the zero vector.
#[derive(Debug, Clone)]
pub struct PaddedBatch {
    pub embeddings: Tensor,
    pub lengths: Vec<usize>,
}

/// Embedded column names for a batch of schemas.
#[derive(Debug, Clone)]
pub struct ColumnBatch {
    /// `[batch, max_columns, max_tokens, dim]`, zero padded in both length dimensions.
    pub embeddings: Tensor,
    /// Number of columns in each schema.
    pub column_counts: Vec<usize>,
    /// `[batch][max_columns]` token count of every column; 0 where a schema has no column.
    pub name_lengths: Vec<Vec<usize>>,
}

/// Average equally sized rows. Returns an empty vector for no rows.
pub(crate) fn mean_rows(rows: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let mut mean = vec![0f32; first.len()];
    for row in rows {
        for (acc, v) in mean.iter_mut().zip(row) {
            *acc += v;
        }
    }
    let n = rows.len() as f32;
    mean.iter_mut().for_each(|v| *v /= n);
    mean
}
