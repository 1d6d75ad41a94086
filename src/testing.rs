//! Test doubles shared by the unit tests.

use std::cell::RefCell;

use candle_core::{Device, Tensor};
use headwater::{EmbedMode, EmbedderError, ExternalEmbedder};

use crate::backend::EmbeddingBackend;
use crate::common::Result;
use crate::vocab::VocabularyTable;

/// `a`, `b`, `c` with easily averaged 2-d vectors.
pub fn abc_vocab() -> VocabularyTable {
    VocabularyTable::from_entries(
        2,
        [
            ("a", vec![1.0, 2.0]),
            ("b", vec![3.0, 4.0]),
            ("c", vec![5.0, 6.0]),
        ],
    )
    .unwrap()
}

pub fn flat(tensor: &Tensor) -> Vec<f32> {
    tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

/// Deterministic external embedder that records every request.
///
/// Word vectors are `[len, 1]`, sentence vectors `[len, 2]`.
pub struct RecordingEmbedder {
    dim: usize,
    calls: RefCell<Vec<(String, EmbedMode)>>,
}

impl Default for RecordingEmbedder {
    fn default() -> Self {
        Self::with_dim(2)
    }
}

impl RecordingEmbedder {
    /// Reports `dim` from [`ExternalEmbedder::dim`]; vectors stay 2-d.
    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, EmbedMode)> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl ExternalEmbedder for RecordingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str, mode: EmbedMode) -> std::result::Result<Vec<f32>, EmbedderError> {
        self.calls.borrow_mut().push((text.to_string(), mode));
        let tag = match mode {
            EmbedMode::Word => 1.0,
            EmbedMode::Sentence => 2.0,
        };
        Ok(vec![text.chars().count() as f32, tag])
    }
}

pub struct FailingEmbedder;

impl ExternalEmbedder for FailingEmbedder {
    fn dim(&self) -> usize {
        2
    }

    fn embed(&self, _text: &str, _mode: EmbedMode) -> std::result::Result<Vec<f32>, EmbedderError> {
        Err(EmbedderError::ApiError("service unavailable".to_string()))
    }
}

/// Wraps a backend and counts calls into it.
pub struct CountingBackend<B> {
    pub inner: B,
    pub lookups: usize,
}

impl<B> CountingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self { inner, lookups: 0 }
    }
}

impl<B: EmbeddingBackend> EmbeddingBackend for CountingBackend<B> {
    fn embedding_dim(&self) -> usize {
        self.inner.embedding_dim()
    }

    fn lookup(
        &mut self,
        tokens: &[Vec<String>],
        max_len: usize,
        device: &Device,
    ) -> Result<Tensor> {
        self.lookups += 1;
        self.inner.lookup(tokens, max_len, device)
    }

    fn sentence_vectors(&mut self, sentences: &[String], device: &Device) -> Result<Option<Tensor>> {
        self.inner.sentence_vectors(sentences, device)
    }
}
