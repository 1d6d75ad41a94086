//! Token → vector resolution for the three kinds of pretrained source.
//!
//! | Backend                        | Token vectors                  | Sentence mean             |
//! |--------------------------------|--------------------------------|---------------------------|
//! | [`StaticTable`] (GloVe)        | fixed [`VocabularyTable`]      | mean of token vectors     |
//! | [`ExternalBackend::word`]      | external embedder, word mode   | mean of token vectors     |
//! | [`ExternalBackend::sentence`]  | external embedder, sentence mode | one call per sentence   |
//!
//! The batch engine pads and reduces; backends only fill token slots.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Embedding, Module};
use headwater::{EmbedMode, ExternalEmbedder};
use tracing::{debug, info};

use crate::common::{EmbeddingError, PADDING_IDX, Result, VocabIdx};
use crate::dynamic::DynamicVocabulary;
use crate::embedder::EmbeddingOptions;
use crate::vocab::VocabularyTable;

pub trait EmbeddingBackend {
    fn embedding_dim(&self) -> usize;

    /// Embed already tokenized sentences as `[batch, max_len, dim]` on `device`.
    ///
    /// Slots past a sentence's length and unknown tokens are zero vectors.
    /// `max_len` is at least the longest sentence.
    fn lookup(&mut self, tokens: &[Vec<String>], max_len: usize, device: &Device)
    -> Result<Tensor>;

    /// One `[batch, dim]` vector per normalized sentence, when the backend
    /// embeds sentences as a whole. `None` asks the engine to average token vectors.
    fn sentence_vectors(
        &mut self,
        _sentences: &[String],
        _device: &Device,
    ) -> Result<Option<Tensor>> {
        Ok(None)
    }
}

/// Lay out per-token slot indices for a `[batch, max_len]` grid, padding with [`PADDING_IDX`].
fn slot_grid<F>(tokens: &[Vec<String>], max_len: usize, mut slot: F) -> Result<Vec<u32>>
where
    F: FnMut(&str) -> Result<VocabIdx>,
{
    let mut ids = vec![PADDING_IDX.0; tokens.len() * max_len];
    for (i, sentence) in tokens.iter().enumerate() {
        for (j, token) in sentence.iter().take(max_len).enumerate() {
            ids[i * max_len + j] = slot(token)?.0;
        }
    }
    Ok(ids)
}

/// Copy rows named by `ids` out of a row-major matrix into a `[batch, max_len, dim]` tensor.
fn gather_rows(
    matrix: &[f32],
    dim: usize,
    ids: &[u32],
    batch: usize,
    max_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut values = Vec::with_capacity(ids.len() * dim);
    for &id in ids {
        let start = id as usize * dim;
        values.extend_from_slice(&matrix[start..start + dim]);
    }
    Ok(Tensor::from_vec(values, (batch, max_len, dim), device)?)
}

// ============================================================================
// Static table
// ============================================================================

/// Backend over a fixed pretrained vocabulary.
///
/// With `use_embedding` the matrix is materialized once as a lookup table on
/// the compute device and batches are resolved with an index gather there.
/// Otherwise rows are copied from host memory. With `trainable` the word rows
/// are backed by a [`Var`] so an optimizer can update them; the padding row
/// stays a constant zero row outside the variable, so padding and unknown
/// tokens never receive gradient.
pub struct StaticTable {
    vocab: VocabularyTable,
    table: TableLookup,
}

enum TableLookup {
    /// Rows copied from the host matrix.
    Host,
    /// Constant device-resident table.
    Frozen(Embedding),
    /// Zero padding row joined with trainable rows `1..` on every lookup.
    Trainable { padding: Tensor, rows: Var },
}

impl StaticTable {
    pub fn new(vocab: VocabularyTable, options: &EmbeddingOptions, device: &Device) -> Result<Self> {
        let dim = vocab.embedding_dim();
        let table = match (options.use_embedding, options.trainable) {
            (false, trainable) => {
                if trainable {
                    info!("Host lookup has no trainable table; ignoring trainable");
                }
                TableLookup::Host
            }
            (true, false) => {
                let shape = (vocab.num_embeddings(), dim);
                let matrix = Tensor::from_slice(vocab.as_slice(), shape, device)?;
                TableLookup::Frozen(Embedding::new(matrix, dim))
            }
            (true, true) => {
                let shape = (vocab.num_embeddings() - 1, dim);
                let words = Tensor::from_slice(&vocab.as_slice()[dim..], shape, device)?;
                TableLookup::Trainable {
                    padding: Tensor::zeros((1, dim), DType::F32, device)?,
                    rows: Var::from_tensor(&words)?,
                }
            }
        };

        Ok(Self { vocab, table })
    }

    pub fn vocab(&self) -> &VocabularyTable {
        &self.vocab
    }

    /// Whether a device-resident lookup table was built.
    pub fn is_materialized(&self) -> bool {
        !matches!(self.table, TableLookup::Host)
    }

    /// The variables an optimizer may update; empty unless built as trainable.
    ///
    /// The variable holds rows `1..` of the vocabulary; row 0 is not trainable.
    pub fn trainable_vars(&self) -> Vec<Var> {
        match &self.table {
            TableLookup::Trainable { rows, .. } => vec![rows.clone()],
            _ => Vec::new(),
        }
    }
}

impl EmbeddingBackend for StaticTable {
    fn embedding_dim(&self) -> usize {
        self.vocab.embedding_dim()
    }

    fn lookup(
        &mut self,
        tokens: &[Vec<String>],
        max_len: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let vocab = &self.vocab;
        let ids = slot_grid(tokens, max_len, |token| Ok(vocab.index(token)))?;

        match &self.table {
            TableLookup::Host => gather_rows(
                vocab.as_slice(),
                vocab.embedding_dim(),
                &ids,
                tokens.len(),
                max_len,
                device,
            ),
            TableLookup::Frozen(embedding) => {
                let ids = Tensor::from_vec(ids, (tokens.len(), max_len), device)?;
                Ok(embedding.forward(&ids)?)
            }
            TableLookup::Trainable { padding, rows } => {
                let ids = Tensor::from_vec(ids, (tokens.len(), max_len), device)?;
                let matrix = Tensor::cat(&[padding, rows.as_tensor()], 0)?;
                Ok(Embedding::new(matrix, vocab.embedding_dim()).forward(&ids)?)
            }
        }
    }
}

// ============================================================================
// External embedders
// ============================================================================

/// Backend that asks an [`ExternalEmbedder`] for vectors and remembers them.
///
/// Every distinct token is sent to the embedder once; later batches read the
/// stored vector. The sentence variant also answers mean requests by
/// embedding the whole sentence, since a sentence vector is not an average
/// of word vectors.
pub struct ExternalBackend<E> {
    embedder: E,
    store: DynamicVocabulary,
    mode: EmbedMode,
}

impl<E: ExternalEmbedder> ExternalBackend<E> {
    /// fastText-style: tokens embedded as words, sentences averaged.
    pub fn word(embedder: E) -> Result<Self> {
        Self::with_mode(embedder, EmbedMode::Word)
    }

    /// LASER-style: tokens and whole sentences embedded as sentences.
    pub fn sentence(embedder: E) -> Result<Self> {
        Self::with_mode(embedder, EmbedMode::Sentence)
    }

    /// Fails with [`EmbeddingError::ZeroDimension`] when the embedder reports `dim() == 0`.
    fn with_mode(embedder: E, mode: EmbedMode) -> Result<Self> {
        let store = DynamicVocabulary::new(embedder.dim())?;
        Ok(Self {
            embedder,
            store,
            mode,
        })
    }

    pub fn mode(&self) -> EmbedMode {
        self.mode
    }

    pub fn store(&self) -> &DynamicVocabulary {
        &self.store
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }
}

impl<E: ExternalEmbedder> EmbeddingBackend for ExternalBackend<E> {
    fn embedding_dim(&self) -> usize {
        self.store.embedding_dim()
    }

    fn lookup(
        &mut self,
        tokens: &[Vec<String>],
        max_len: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let Self {
            embedder,
            store,
            mode,
        } = self;
        let before = store.num_embeddings();
        let ids = slot_grid(tokens, max_len, |token| {
            store.get_or_insert(token, |t| embedder.embed(t, *mode))
        })?;
        let added = store.num_embeddings() - before;
        if added > 0 {
            debug!("Embedded {} new tokens ({} mode)", added, mode);
        }

        gather_rows(
            store.as_slice(),
            store.embedding_dim(),
            &ids,
            tokens.len(),
            max_len,
            device,
        )
    }

    fn sentence_vectors(&mut self, sentences: &[String], device: &Device) -> Result<Option<Tensor>> {
        if self.mode != EmbedMode::Sentence {
            return Ok(None);
        }

        let dim = self.store.embedding_dim();
        let mut values = Vec::with_capacity(sentences.len() * dim);
        for sentence in sentences {
            let vector = self.embedder.embed(sentence, EmbedMode::Sentence)?;
            if vector.len() != dim {
                return Err(EmbeddingError::DimensionMismatch {
                    token: sentence.clone(),
                    expected: dim,
                    actual: vector.len(),
                });
            }
            values.extend_from_slice(&vector);
        }
        Ok(Some(Tensor::from_vec(values, (sentences.len(), dim), device)?))
    }
}

#[cfg(test)]
mod tests {
    use candle_nn::optim::{Optimizer, SGD};

    use super::*;
    use crate::testing::{RecordingEmbedder, abc_vocab, flat};

    fn tokens(sentences: &[&str]) -> Vec<Vec<String>> {
        sentences
            .iter()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn test_materialized_matches_host_gather() {
        let device = Device::Cpu;
        let batch = tokens(&["a b", "c zebra", ""]);

        let options = EmbeddingOptions::default();
        let mut table = StaticTable::new(abc_vocab(), &options, &device).unwrap();
        assert!(table.is_materialized());
        let on_device = table.lookup(&batch, 2, &device).unwrap();

        let options = options.with_use_embedding(false);
        let mut host = StaticTable::new(abc_vocab(), &options, &device).unwrap();
        assert!(!host.is_materialized());
        let gathered = host.lookup(&batch, 2, &device).unwrap();

        assert_eq!(on_device.dims(), &[3, 2, 2]);
        assert_eq!(flat(&on_device), flat(&gathered));
        assert_eq!(
            flat(&gathered),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_trainable_exposes_word_rows() {
        let device = Device::Cpu;
        let options = EmbeddingOptions::default().with_trainable(true);
        let trainable = StaticTable::new(abc_vocab(), &options, &device).unwrap();
        let vars = trainable.trainable_vars();
        assert_eq!(vars.len(), 1);
        // Row 0 is held outside the variable.
        assert_eq!(vars[0].as_tensor().dims(), &[3, 2]);
    }

    #[test]
    fn test_trainable_padding_row_stays_zero_after_step() {
        let device = Device::Cpu;
        let options = EmbeddingOptions::default().with_trainable(true);
        let mut table = StaticTable::new(abc_vocab(), &options, &device).unwrap();
        let batch = vec![
            vec!["a".to_string(), "zebra".to_string()],
            vec!["b".to_string()],
        ];

        let out = table.lookup(&batch, 2, &device).unwrap();
        let mut sgd = SGD::new(table.trainable_vars(), 0.5).unwrap();
        sgd.backward_step(&out.sum_all().unwrap()).unwrap();

        let after = table.lookup(&batch, 2, &device).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(after[0][0], vec![0.5, 1.5]);
        assert_eq!(after[0][1], vec![0.0, 0.0], "unknown slot");
        assert_eq!(after[1][0], vec![2.5, 3.5]);
        assert_eq!(after[1][1], vec![0.0, 0.0], "padding slot");
    }

    #[test]
    fn test_frozen_table_has_no_vars_and_is_stable() {
        let device = Device::Cpu;
        let batch = tokens(&["a zebra", "c"]);
        let mut frozen =
            StaticTable::new(abc_vocab(), &EmbeddingOptions::default(), &device).unwrap();
        assert!(frozen.trainable_vars().is_empty());

        let first = frozen.lookup(&batch, 2, &device).unwrap();
        let second = frozen.lookup(&batch, 2, &device).unwrap();
        assert_eq!(flat(&first), flat(&second));
        assert_eq!(flat(&first), vec![1.0, 2.0, 0.0, 0.0, 5.0, 6.0, 0.0, 0.0]);
    }

    #[test]
    fn test_trainable_ignored_for_host_lookup() {
        let device = Device::Cpu;
        let options = EmbeddingOptions::default()
            .with_trainable(true)
            .with_use_embedding(false);
        let table = StaticTable::new(abc_vocab(), &options, &device).unwrap();
        assert!(!table.is_materialized());
        assert!(table.trainable_vars().is_empty());
    }

    #[test]
    fn test_external_zero_dimension_rejected() {
        let source = RecordingEmbedder::with_dim(0);
        assert!(matches!(
            ExternalBackend::word(&source),
            Err(EmbeddingError::ZeroDimension)
        ));
    }

    #[test]
    fn test_static_table_has_no_sentence_path() {
        let device = Device::Cpu;
        let mut table =
            StaticTable::new(abc_vocab(), &EmbeddingOptions::default(), &device).unwrap();
        let sentences = vec!["a b".to_string()];
        assert!(table.sentence_vectors(&sentences, &device).unwrap().is_none());
    }

    #[test]
    fn test_external_lookup_memoizes_tokens() {
        let device = Device::Cpu;
        let source = RecordingEmbedder::default();
        let mut backend = ExternalBackend::word(&source).unwrap();

        let out = backend.lookup(&tokens(&["ab abc", "ab"]), 2, &device).unwrap();
        assert_eq!(flat(&out), vec![2.0, 1.0, 3.0, 1.0, 2.0, 1.0, 0.0, 0.0]);
        assert_eq!(source.call_count(), 2);

        backend.lookup(&tokens(&["abc ab"]), 2, &device).unwrap();
        assert_eq!(source.call_count(), 2);
        assert_eq!(backend.store().index("abc"), Some(VocabIdx(2)));
    }

    #[test]
    fn test_word_mode_has_no_sentence_path() {
        let device = Device::Cpu;
        let source = RecordingEmbedder::default();
        let mut backend = ExternalBackend::word(&source).unwrap();
        let sentences = vec!["ab".to_string()];
        assert!(backend.sentence_vectors(&sentences, &device).unwrap().is_none());
        assert_eq!(source.call_count(), 0);
        assert_eq!(backend.mode(), EmbedMode::Word);
    }
}
