//! The external embedder contract, plus a blocking client for an
//! OpenAI-compatible embedding service.
//!
//! External embedders are black boxes to the embedding layer: they map one
//! piece of text to one fixed-length vector. Word mode embeds a single token
//! (fastText-style), sentence mode embeds a whole sentence (LASER-style).

use std::fmt;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("base URL not found in environment: {0}")]
    BaseUrlNotFound(String),

    #[error("API key not found in environment: {0}")]
    ApiKeyNotFound(String),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("failed to parse API response: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("API returned an error: {0}")]
    ApiError(String),

    #[error("embedding has dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("failed to initialize embedding model: {0}")]
    InitError(String),

    #[error("tokenization failed: {0}")]
    TokenizeError(String),

    #[error("model not loaded")]
    NotLoaded,

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("HF Hub error: {0}")]
    HfHub(#[from] hf_hub::api::sync::ApiError),
}

// ============================================================================
// Contract
// ============================================================================

/// Granularity requested from an external embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedMode {
    /// Embed a single token.
    Word,
    /// Embed a whole sentence as one vector.
    Sentence,
}

impl fmt::Display for EmbedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedMode::Word => f.write_str("word"),
            EmbedMode::Sentence => f.write_str("sentence"),
        }
    }
}

pub trait ExternalEmbedder {
    /// Length of every vector returned by [`ExternalEmbedder::embed`].
    fn dim(&self) -> usize;

    /// Embed `text` into a vector of length [`ExternalEmbedder::dim`].
    ///
    /// Failures are returned as-is; implementations do not retry.
    fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbedderError>;
}

impl<E: ExternalEmbedder + ?Sized> ExternalEmbedder for &E {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbedderError> {
        (**self).embed(text, mode)
    }
}

impl<E: ExternalEmbedder + ?Sized> ExternalEmbedder for Box<E> {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbedderError> {
        (**self).embed(text, mode)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Default dimension of LASER sentence vectors.
pub const DEFAULT_REMOTE_DIM: usize = 1024;

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// The URL of the OpenAI-compatible embeddings endpoint
    pub base_url: String,
    /// Bearer token for the endpoint
    pub api_key: String,
    /// Model used for [`EmbedMode::Word`] requests
    pub word_model: String,
    /// Model used for [`EmbedMode::Sentence`] requests
    pub sentence_model: String,
    /// Expected dimension of every returned vector
    pub dim: usize,
    /// The timeout for a single HTTP request.
    pub request_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            word_model: "fasttext".to_string(),
            sentence_model: "laser".to_string(),
            dim: DEFAULT_REMOTE_DIM,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Read the endpoint from `EMBEDDER_URL` / `EMBEDDER_API_KEY`.
    ///
    /// `EMBEDDER_WORD_MODEL` and `EMBEDDER_SENTENCE_MODEL` override the model
    /// names when set.
    pub fn from_env() -> Result<Self, EmbedderError> {
        let base_url = std::env::var("EMBEDDER_URL")
            .map_err(|e| EmbedderError::BaseUrlNotFound(e.to_string()))?;
        let api_key = std::env::var("EMBEDDER_API_KEY")
            .map_err(|e| EmbedderError::ApiKeyNotFound(e.to_string()))?;
        let mut config = Self::new(&base_url, &api_key);
        if let Ok(model) = std::env::var("EMBEDDER_WORD_MODEL") {
            config.word_model = model;
        }
        if let Ok(model) = std::env::var("EMBEDDER_SENTENCE_MODEL") {
            config.sentence_model = model;
        }
        Ok(config)
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    pub fn with_models(mut self, word_model: &str, sentence_model: &str) -> Self {
        self.word_model = word_model.to_string();
        self.sentence_model = sentence_model.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn model_for(&self, mode: EmbedMode) -> &str {
        match mode {
            EmbedMode::Word => &self.word_model,
            EmbedMode::Sentence => &self.sentence_model,
        }
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================
#[derive(Serialize)]
struct ApiRequest<'a> {
    input: &'a [&'a str],
    model: &'a str,
}

#[derive(Deserialize)]
struct ApiResponseItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ApiResponse {
    data: Vec<ApiResponseItem>,
}

/// Validate a decoded response against the request it answers.
fn unpack_response(
    parsed: ApiResponse,
    expected_items: usize,
    dim: usize,
) -> Result<Vec<Vec<f32>>, EmbedderError> {
    if parsed.data.len() != expected_items {
        return Err(EmbedderError::ApiError(format!(
            "expected {} embeddings, got {}",
            expected_items,
            parsed.data.len()
        )));
    }

    parsed
        .data
        .into_iter()
        .map(|item| {
            if item.embedding.len() != dim {
                return Err(EmbedderError::DimensionMismatch {
                    expected: dim,
                    actual: item.embedding.len(),
                });
            }
            Ok(item.embedding)
        })
        .collect()
}

// ============================================================================
// Implementation
// ============================================================================

pub struct RemoteEmbedder {
    client: Client,
    config: RemoteConfig,
}

impl RemoteEmbedder {
    pub fn new(config: RemoteConfig) -> Result<Self, EmbedderError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", &config.api_key))?,
        );
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(config.request_timeout)
            .default_headers(default_headers)
            .tcp_nodelay(true)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Embed several texts in one request.
    pub fn send_batch(
        &self,
        texts: &[&str],
        mode: EmbedMode,
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!("Embedder API call: embedding {} texts ({})", texts.len(), mode);

        let payload = ApiRequest {
            input: texts,
            model: self.config.model_for(mode),
        };

        let response = self
            .client
            .post(&self.config.base_url)
            .json(&payload)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let bytes = response.bytes()?;
            let body_str = String::from_utf8_lossy(&bytes);
            return Err(EmbedderError::ApiError(format!(
                "API error: status={}, body={}",
                status, body_str
            )));
        }

        let bytes = response.bytes()?;
        let parsed: ApiResponse = serde_json::from_slice(&bytes)?;
        unpack_response(parsed, texts.len(), self.config.dim)
    }
}

impl ExternalEmbedder for RemoteEmbedder {
    fn dim(&self) -> usize {
        self.config.dim
    }

    fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbedderError> {
        self.send_batch(&[text], mode)?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedderError::ApiError("no embedding returned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_mode_model() {
        let config = RemoteConfig::new("http://localhost:8000/v1/embeddings", "key")
            .with_models("ft-en", "laser-en");
        let payload = ApiRequest {
            input: &["select name"],
            model: config.model_for(EmbedMode::Sentence),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"input":["select name"],"model":"laser-en"}"#);
        assert_eq!(config.model_for(EmbedMode::Word), "ft-en");
    }

    #[test]
    fn test_unpack_response_checks_count_and_dim() {
        let body = r#"{"data":[{"embedding":[0.1,0.2,0.3]},{"embedding":[0.4,0.5,0.6]}]}"#;
        let parsed: ApiResponse = serde_json::from_str(body).unwrap();
        let vectors = unpack_response(parsed, 2, 3).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![0.4, 0.5, 0.6]);

        let parsed: ApiResponse = serde_json::from_str(body).unwrap();
        assert!(matches!(
            unpack_response(parsed, 3, 3),
            Err(EmbedderError::ApiError(_))
        ));

        let parsed: ApiResponse = serde_json::from_str(body).unwrap();
        assert!(matches!(
            unpack_response(parsed, 2, 4),
            Err(EmbedderError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_embed_mode_serde() {
        assert_eq!(serde_json::to_string(&EmbedMode::Word).unwrap(), "\"word\"");
        assert_eq!(EmbedMode::Sentence.to_string(), "sentence");
    }

    #[test]
    #[ignore] // requires EMBEDDER_URL and EMBEDDER_API_KEY env vars
    fn test_embed_live() {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .try_init()
            .ok();

        let config = RemoteConfig::from_env().expect("EMBEDDER_URL and EMBEDDER_API_KEY must be set");
        let embedder = RemoteEmbedder::new(config).expect("failed to build embedder");

        let word = embedder.embed("customers", EmbedMode::Word).expect("word embed failed");
        let sentence = embedder
            .embed("how many customers live in paris", EmbedMode::Sentence)
            .expect("sentence embed failed");

        assert_eq!(word.len(), embedder.dim());
        assert_eq!(sentence.len(), embedder.dim());
        tracing::info!("word and sentence vectors have dimension {}", embedder.dim());
    }
}
