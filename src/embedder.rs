//! Batch embedding engine.
//!
//! Turns questions, interaction histories, and table schemas into padded
//! tensors for the predictor modules:
//! - `embed`: sentences → `[batch, max_len, dim]` (or `[batch, dim]` when averaged)
//! - `embed_history`: phrase lists → `[batch, max_history_len, dim]`
//! - `embed_columns`: schemas → `[batch, max_columns, max_tokens, dim]`, memoized per schema
//!
//! An embedder mutates its column cache (and, for external backends, its
//! vocabulary) while embedding, so every operation takes `&mut self`. Sharing
//! one across threads means wrapping it in a lock.

use std::path::Path;

use candle_core::{Device, Tensor};
use headwater::ExternalEmbedder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{EmbeddingBackend, ExternalBackend, StaticTable};
use crate::cache::{CachedColumns, ColumnCache};
use crate::common::{ColumnBatch, EmbeddingError, PaddedBatch, Result, mean_rows};
use crate::placement::Placement;
use crate::tokenizer::{Tokenizer, WordTokenizer, normalize};
use crate::vocab::VocabularyTable;

// ============================================================================
// Configuration
// ============================================================================

/// Construction options for an embedder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingOptions {
    /// Whether the pretrained table may be updated by training. Only takes
    /// effect with `use_embedding`; the padding row is never trainable.
    pub trainable: bool,
    /// Memoize column embeddings per schema
    pub use_column_cache: bool,
    /// Maximum number of cached schemas; `None` never evicts
    pub column_cache_capacity: Option<usize>,
    /// Place tensors on CUDA device 0
    pub gpu: bool,
    /// Materialize a device-resident lookup table for static vectors
    pub use_embedding: bool,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            trainable: false,
            use_column_cache: true,
            column_cache_capacity: None,
            gpu: false,
            use_embedding: true,
        }
    }
}

impl EmbeddingOptions {
    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn with_column_cache(mut self, enabled: bool) -> Self {
        self.use_column_cache = enabled;
        self
    }

    /// Bound the column cache, evicting the least recently used schema first.
    pub fn with_column_cache_capacity(mut self, capacity: usize) -> Self {
        self.column_cache_capacity = Some(capacity);
        self
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_use_embedding(mut self, use_embedding: bool) -> Self {
        self.use_embedding = use_embedding;
        self
    }
}

// ============================================================================
// Embedder
// ============================================================================

pub struct BatchEmbedder<B, T = WordTokenizer> {
    backend: B,
    tokenizer: T,
    placement: Placement,
    cache: ColumnCache,
    use_column_cache: bool,
}

impl BatchEmbedder<StaticTable> {
    /// GloVe-style embedder over a vector file of dimension `dim`.
    pub fn glove(path: &Path, dim: usize, options: EmbeddingOptions) -> Result<Self> {
        let placement = Placement::from_flag(options.gpu)?;
        let vocab = VocabularyTable::load(path, dim)?;
        let backend = StaticTable::new(vocab, &options, placement.device())?;
        Ok(Self::new(backend, placement, &options))
    }
}

impl<E: ExternalEmbedder> BatchEmbedder<ExternalBackend<E>> {
    /// fastText-style embedder: words are embedded one at a time and remembered.
    pub fn external_word(embedder: E, options: EmbeddingOptions) -> Result<Self> {
        let placement = Placement::from_flag(options.gpu)?;
        Ok(Self::new(ExternalBackend::word(embedder)?, placement, &options))
    }

    /// LASER-style embedder: averaged requests embed the whole sentence.
    pub fn external_sentence(embedder: E, options: EmbeddingOptions) -> Result<Self> {
        let placement = Placement::from_flag(options.gpu)?;
        Ok(Self::new(ExternalBackend::sentence(embedder)?, placement, &options))
    }
}

impl<B: EmbeddingBackend> BatchEmbedder<B> {
    pub fn new(backend: B, placement: Placement, options: &EmbeddingOptions) -> Self {
        Self {
            backend,
            tokenizer: WordTokenizer,
            placement,
            cache: ColumnCache::new(options.column_cache_capacity),
            use_column_cache: options.use_column_cache,
        }
    }
}

impl<B: EmbeddingBackend, T: Tokenizer> BatchEmbedder<B, T> {
    /// Swap in a different tokenizer. The column cache is dropped, since
    /// cached token counts depend on the tokenizer.
    pub fn with_tokenizer<U: Tokenizer>(self, tokenizer: U) -> BatchEmbedder<B, U> {
        BatchEmbedder {
            backend: self.backend,
            tokenizer,
            placement: self.placement,
            cache: ColumnCache::new(self.cache.capacity()),
            use_column_cache: self.use_column_cache,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.backend.embedding_dim()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn column_cache(&self) -> &ColumnCache {
        &self.cache
    }

    pub fn clear_column_cache(&mut self) {
        self.cache.clear();
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        self.tokenizer.tokenize(&normalize(text))
    }

    // ========================================================================
    // Sentences
    // ========================================================================

    /// Embed one sentence; see [`Self::embed`].
    pub fn embed_one(&mut self, sentence: &str, mean_sequence: bool) -> Result<PaddedBatch> {
        self.embed(&[sentence], mean_sequence)
    }

    /// Embed a batch of sentences.
    ///
    /// Returns `[batch, max_len, dim]` padded with zero vectors, or
    /// `[batch, dim]` when `mean_sequence` averages each sentence over its
    /// true length. `lengths[i]` is the token count of sentence `i`.
    pub fn embed<S: AsRef<str>>(
        &mut self,
        sentences: &[S],
        mean_sequence: bool,
    ) -> Result<PaddedBatch> {
        if sentences.is_empty() {
            return Err(EmbeddingError::EmptyBatch);
        }

        let normalized: Vec<String> = sentences.iter().map(|s| normalize(s.as_ref())).collect();
        let tokens: Vec<Vec<String>> = normalized
            .iter()
            .map(|s| self.tokenizer.tokenize(s))
            .collect();
        let lengths: Vec<usize> = tokens.iter().map(Vec::len).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(0).max(1);
        let device = self.placement.device().clone();

        if mean_sequence {
            if let Some(embeddings) = self.backend.sentence_vectors(&normalized, &device)? {
                return Ok(PaddedBatch {
                    embeddings,
                    lengths,
                });
            }
        }

        let embeddings = self.backend.lookup(&tokens, max_len, &device)?;
        let embeddings = if mean_sequence {
            mean_over_lengths(&embeddings, &lengths, &device)?
        } else {
            embeddings
        };

        Ok(PaddedBatch {
            embeddings,
            lengths,
        })
    }

    // ========================================================================
    // Histories
    // ========================================================================

    /// Embed a phrase such as `"col1 text db"` or `"max_speed"` as one `[dim]` vector.
    ///
    /// Words are split on whitespace and then on `_`; each piece is embedded
    /// as an averaged sentence, pieces are averaged into their word, and
    /// words are averaged into the phrase. Empty pieces are skipped.
    pub fn embed_token(&mut self, token: &str) -> Result<Tensor> {
        let vector = self.phrase_vector(token)?;
        let dim = vector.len();
        Ok(Tensor::from_vec(vector, dim, self.placement.device())?)
    }

    fn phrase_vector(&mut self, token: &str) -> Result<Vec<f32>> {
        let mut word_vectors = Vec::new();
        for word in token.split_whitespace() {
            let parts: Vec<&str> = word.split('_').filter(|part| !part.is_empty()).collect();
            if parts.is_empty() {
                continue;
            }
            let batch = self.embed(parts.as_slice(), true)?;
            let part_vectors = self
                .placement
                .download(&batch.embeddings)?
                .to_vec2::<f32>()?;
            word_vectors.push(mean_rows(&part_vectors));
        }

        if word_vectors.is_empty() {
            return Err(EmbeddingError::EmptyToken(token.to_string()));
        }
        Ok(mean_rows(&word_vectors))
    }

    /// Embed interaction histories, one vector per phrase.
    ///
    /// Returns `[batch, max_history_len, dim]` zero padded past each history's length.
    pub fn embed_history<S: AsRef<str>>(&mut self, histories: &[Vec<S>]) -> Result<PaddedBatch> {
        if histories.is_empty() {
            return Err(EmbeddingError::EmptyBatch);
        }

        let dim = self.embedding_dim();
        let lengths: Vec<usize> = histories.iter().map(Vec::len).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(0).max(1);

        let mut values = vec![0f32; histories.len() * max_len * dim];
        for (i, history) in histories.iter().enumerate() {
            for (j, token) in history.iter().enumerate() {
                let vector = self.phrase_vector(token.as_ref())?;
                let start = (i * max_len + j) * dim;
                values[start..start + dim].copy_from_slice(&vector);
            }
        }

        let embeddings = Tensor::from_vec(values, (histories.len(), max_len, dim), &Device::Cpu)?;
        Ok(PaddedBatch {
            embeddings: self.placement.upload(&embeddings)?,
            lengths,
        })
    }

    // ========================================================================
    // Columns
    // ========================================================================

    /// Embed the column names of a batch of schemas, indexed `[schema][column][word]`.
    ///
    /// Each column's words are joined with spaces and tokenized, so a
    /// column's token count can differ from its word count. Schemas already
    /// seen are copied from the column cache; when the cached entry was
    /// padded for a different batch only the overlapping region is copied.
    pub fn embed_columns<S: AsRef<str>>(&mut self, columns: &[Vec<Vec<S>>]) -> Result<ColumnBatch> {
        if columns.is_empty() {
            return Err(EmbeddingError::EmptyBatch);
        }
        if let Some(empty) = columns.iter().position(Vec::is_empty) {
            return Err(EmbeddingError::EmptySchema(empty));
        }

        let joined: Vec<Vec<String>> = columns
            .iter()
            .map(|schema| {
                schema
                    .iter()
                    .map(|words| {
                        words
                            .iter()
                            .map(AsRef::as_ref)
                            .collect::<Vec<&str>>()
                            .join(" ")
                    })
                    .collect()
            })
            .collect();
        let token_counts: Vec<Vec<usize>> = joined
            .iter()
            .map(|schema| schema.iter().map(|c| self.tokenize(c).len()).collect())
            .collect();

        let dim = self.embedding_dim();
        let batch_size = columns.len();
        let column_counts: Vec<usize> = columns.iter().map(Vec::len).collect();
        let max_columns = column_counts.iter().copied().max().unwrap_or(1);
        let max_tokens = token_counts
            .iter()
            .flatten()
            .copied()
            .max()
            .unwrap_or(0)
            .max(1);

        let column_stride = max_tokens * dim;
        let schema_stride = max_columns * column_stride;
        let mut values = vec![0f32; batch_size * schema_stride];
        let mut name_lengths = vec![vec![0usize; max_columns]; batch_size];

        for (i, schema) in joined.iter().enumerate() {
            let key = ColumnCache::key(schema.as_slice())?;
            let block = &mut values[i * schema_stride..(i + 1) * schema_stride];

            if let Some(cached) = self.cache.get(&key) {
                let (cached_columns, cached_tokens, _) = cached.embeddings.dims3()?;
                let keep_columns = cached_columns.min(max_columns);
                let keep_tokens = cached_tokens.min(max_tokens);
                if keep_columns < cached_columns || keep_tokens < cached_tokens {
                    debug!(
                        "Truncating cached schema from [{}, {}] to [{}, {}]",
                        cached_columns, cached_tokens, keep_columns, keep_tokens
                    );
                }

                let region = cached
                    .embeddings
                    .narrow(0, 0, keep_columns)?
                    .narrow(1, 0, keep_tokens)?
                    .to_vec3::<f32>()?;
                for (j, column) in region.iter().enumerate() {
                    for (k, token) in column.iter().enumerate() {
                        let start = j * column_stride + k * dim;
                        block[start..start + dim].copy_from_slice(token);
                    }
                    name_lengths[i][j] = cached.name_lengths[j].min(max_tokens);
                }
                debug!("Column cache hit for schema {}", i);
                continue;
            }

            let embedded = self.embed(schema.as_slice(), false)?;
            let rows = self
                .placement
                .download(&embedded.embeddings)?
                .to_vec3::<f32>()?;
            for (j, (column, &length)) in rows.iter().zip(&embedded.lengths).enumerate() {
                for (k, token) in column.iter().take(length).enumerate() {
                    let start = j * column_stride + k * dim;
                    block[start..start + dim].copy_from_slice(token);
                }
                name_lengths[i][j] = length;
            }

            if self.use_column_cache {
                let entry = CachedColumns {
                    embeddings: Tensor::from_slice(
                        &*block,
                        (max_columns, max_tokens, dim),
                        &Device::Cpu,
                    )?,
                    name_lengths: name_lengths[i].clone(),
                };
                self.cache.insert(key, entry);
            }
        }

        let embeddings = Tensor::from_vec(
            values,
            (batch_size, max_columns, max_tokens, dim),
            &Device::Cpu,
        )?;
        Ok(ColumnBatch {
            embeddings: self.placement.upload(&embeddings)?,
            column_counts,
            name_lengths,
        })
    }
}

/// Average `[batch, len, dim]` over each item's true length, giving `[batch, dim]`.
///
/// Padding rows are zero, so summing the full length and dividing by the true
/// length leaves the mean undiluted. Empty items come out as zero vectors.
fn mean_over_lengths(embeddings: &Tensor, lengths: &[usize], device: &Device) -> Result<Tensor> {
    let counts: Vec<f32> = lengths.iter().map(|&len| len.max(1) as f32).collect();
    let counts = Tensor::from_vec(counts, (lengths.len(), 1), device)?;
    Ok(embeddings.sum(1)?.broadcast_div(&counts)?)
}
