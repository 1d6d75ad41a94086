//! Local sentence embedder backed by a BERT model on candle.
//!
//! Stands in for a LASER-style sentence encoder when no remote service is
//! available. Word and sentence mode are the same computation: the model's
//! hidden states are mean pooled over the attention mask.

use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as ModelConfig, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use parking_lot::RwLock;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::info;

use crate::embedder::{EmbedMode, EmbedderError, ExternalEmbedder};

type Result<T> = std::result::Result<T, EmbedderError>;

/// Default embedding model
pub const DEFAULT_BERT_REPO: &str = "BAAI/bge-base-en-v1.5";

/// Hidden size of bge-base-en-v1.5
pub const BERT_EMBEDDING_DIM: usize = 768;

/// Max sequence length
pub const MAX_SEQ_LEN: usize = 512;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct BertConfig {
    /// Model repository on HuggingFace
    pub model_repo: String,
    /// CUDA device ordinal; `None` runs on the host
    pub cuda_device: Option<usize>,
    /// Whether to normalize embeddings (L2 norm)
    pub normalize: bool,
    /// Max sequence length
    pub max_seq_len: usize,
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            model_repo: DEFAULT_BERT_REPO.to_string(),
            cuda_device: None,
            normalize: true,
            max_seq_len: MAX_SEQ_LEN,
        }
    }
}

impl BertConfig {
    /// Set a custom model repository
    pub fn with_model(mut self, model_repo: &str) -> Self {
        self.model_repo = model_repo.to_string();
        self
    }

    /// Run on a CUDA device
    pub fn with_cuda_device(mut self, device: usize) -> Self {
        self.cuda_device = Some(device);
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }
}

// ============================================================================
// Model
// ============================================================================

/// Files fetched from the hub for one model repository.
struct ModelFiles {
    tokenizer: PathBuf,
    config: PathBuf,
    weights: PathBuf,
}

impl ModelFiles {
    fn fetch(model_repo: &str) -> Result<Self> {
        let repo = Api::new()?.repo(Repo::new(model_repo.to_string(), RepoType::Model));
        Ok(Self {
            tokenizer: repo.get("tokenizer.json")?,
            config: repo.get("config.json")?,
            weights: repo.get("model.safetensors")?,
        })
    }
}

struct LoadedModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    hidden_size: usize,
    normalize: bool,
}

impl LoadedModel {
    fn load(config: &BertConfig) -> Result<Self> {
        let device = match config.cuda_device {
            Some(ordinal) => Device::new_cuda(ordinal)?,
            None => Device::Cpu,
        };
        info!("Loading {} on {:?}", config.model_repo, device);
        let files = ModelFiles::fetch(&config.model_repo)?;

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| EmbedderError::InitError(format!("tokenizer: {e}")))?;
        tokenizer
            .with_padding(Some(PaddingParams {
                strategy: PaddingStrategy::BatchLongest,
                ..Default::default()
            }))
            .with_truncation(Some(TruncationParams {
                max_length: config.max_seq_len,
                ..Default::default()
            }))
            .map_err(|e| EmbedderError::InitError(format!("truncation: {e}")))?;

        let raw: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&files.config)
                .map_err(|e| EmbedderError::InitError(format!("config: {e}")))?,
        )?;
        let hidden_size = raw
            .get("hidden_size")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| EmbedderError::InitError("config has no hidden_size".to_string()))?
            as usize;
        let model_config: ModelConfig = serde_json::from_value(raw)?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[files.weights], DTYPE, &device)? };
        let model = BertModel::load(vb, &model_config)?;
        info!("Loaded {} (hidden size {})", config.model_repo, hidden_size);

        Ok(Self {
            model,
            tokenizer,
            device,
            hidden_size,
            normalize: config.normalize,
        })
    }

    /// Encode a batch padded to its longest member: `(input_ids, attention_mask)`.
    fn encode(&self, texts: &[&str]) -> Result<(Tensor, Tensor)> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| EmbedderError::TokenizeError(e.to_string()))?;

        let mut ids = Vec::with_capacity(encodings.len());
        let mut mask = Vec::with_capacity(encodings.len());
        for encoding in &encodings {
            ids.push(Tensor::new(encoding.get_ids(), &self.device)?);
            mask.push(Tensor::new(encoding.get_attention_mask(), &self.device)?);
        }
        Ok((Tensor::stack(&ids, 0)?, Tensor::stack(&mask, 0)?))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let (input_ids, attention_mask) = self.encode(texts)?;
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let pooled = masked_mean(&hidden, &attention_mask, self.normalize)?;
        Ok(pooled.to_dtype(DType::F32)?.to_vec2()?)
    }
}

/// Average `[batch, seq, hidden]` over the positions where `mask` is 1,
/// optionally scaling each row to unit length.
fn masked_mean(hidden: &Tensor, mask: &Tensor, normalize: bool) -> CandleResult<Tensor> {
    let mask = mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
    let counts = mask.sum(1)?.clamp(1f32, f32::MAX)?;
    let mean = hidden.broadcast_mul(&mask)?.sum(1)?.broadcast_div(&counts)?;
    if !normalize {
        return Ok(mean);
    }
    let norms = mean.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12f32, f32::MAX)?;
    mean.broadcast_div(&norms)
}

// ============================================================================
// Embedder
// ============================================================================

pub struct BertEmbedder {
    inner: Arc<RwLock<Option<LoadedModel>>>,
    dim: usize,
}

impl BertEmbedder {
    pub fn new(config: BertConfig) -> Result<Self> {
        let model = LoadedModel::load(&config)?;
        let dim = model.hidden_size;

        Ok(Self {
            inner: Arc::new(RwLock::new(Some(model))),
            dim,
        })
    }

    /// Embed a batch of texts in one forward pass.
    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let guard = self.inner.read();
        let model = guard.as_ref().ok_or(EmbedderError::NotLoaded)?;
        model.embed_batch(texts)
    }

    /// Unload the model to free memory
    pub fn unload(&self) {
        let mut guard = self.inner.write();
        *guard = None;
        info!("Model unloaded");
    }
}

impl ExternalEmbedder for BertEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str, _mode: EmbedMode) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedderError::ApiError("no embedding returned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = BertConfig::default();
        assert_eq!(config.model_repo, DEFAULT_BERT_REPO);
        assert!(config.normalize);
        assert_eq!(config.cuda_device, None);
        assert_eq!(config.with_cuda_device(1).cuda_device, Some(1));
    }

    #[test]
    fn test_masked_mean_ignores_padding() {
        let hidden = Tensor::new(
            &[[[1f32, 2.0], [3.0, 4.0], [100.0, 100.0]], [[6.0, 8.0], [0.0, 0.0], [0.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let mask = Tensor::new(&[[1u32, 1, 0], [1, 0, 0]], &Device::Cpu).unwrap();

        let mean = masked_mean(&hidden, &mask, false).unwrap();
        assert_eq!(mean.to_vec2::<f32>().unwrap(), vec![vec![2.0, 3.0], vec![6.0, 8.0]]);

        let unit = masked_mean(&hidden, &mask, true).unwrap().to_vec2::<f32>().unwrap();
        assert!((unit[1][0] - 0.6).abs() < 1e-6);
        assert!((unit[1][1] - 0.8).abs() < 1e-6);
    }

    #[test]
    #[ignore] // Run with: cargo test -p headwater -- --ignored test_embed_column_names
    fn test_embed_column_names() {
        let embedder = BertEmbedder::new(BertConfig::default()).expect("Failed to create embedder");
        assert_eq!(embedder.dim(), BERT_EMBEDDING_DIM);

        let word = embedder.embed("customers", EmbedMode::Word).expect("Failed to embed");
        let sentence = embedder
            .embed("name of customers", EmbedMode::Sentence)
            .expect("Failed to embed");
        assert_eq!(word.len(), BERT_EMBEDDING_DIM);
        assert_eq!(sentence.len(), BERT_EMBEDDING_DIM);

        let norm: f32 = sentence.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01, "Embedding should be normalized, got norm: {}", norm);

        embedder.unload();
        assert!(matches!(
            embedder.embed("customers", EmbedMode::Word),
            Err(EmbedderError::NotLoaded)
        ));
    }
}
