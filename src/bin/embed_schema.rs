//! Embed a batch of questions, histories, and schemas and report the shapes.
//!
//! ## Input
//!
//! A JSON file:
//!
//! ```json
//! {
//!   "questions": ["How many singers are there?"],
//!   "histories": [["none", "select count"]],
//!   "schemas": [[["singer", "id"], ["name"], ["age"]]]
//! }
//! ```
//!
//! `schemas` is indexed `[schema][column][word]`. Columns are embedded twice
//! so the second pass is served from the column cache.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin embed_schema -- --vectors glove.6B.50d.txt --input request.json
//! EMBEDDER_URL=... EMBEDDER_API_KEY=... cargo run --release --bin embed_schema -- \
//!     --backend remote-sentence --dim 1024 --input request.json
//! ```

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use estuary::{BatchEmbedder, EmbeddingBackend, EmbeddingOptions};
use headwater::{BertConfig, BertEmbedder, RemoteConfig, RemoteEmbedder};
use serde::Deserialize;
use tracing::info;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Pretrained vector file
    Glove,
    /// Remote service, one request per new word
    RemoteWord,
    /// Remote service, whole sentences for averaged requests
    RemoteSentence,
    /// Local BERT model from the Hugging Face hub
    Bert,
}

#[derive(Parser, Debug)]
#[command(about = "Embed questions, histories, and schemas")]
struct Args {
    /// Where token vectors come from.
    #[arg(long, value_enum, default_value_t = Backend::Glove)]
    backend: Backend,

    /// Whitespace-separated vector file (glove backend).
    #[arg(long)]
    vectors: Option<PathBuf>,

    /// Vector dimension.
    #[arg(long, default_value_t = 50)]
    dim: usize,

    /// JSON request file.
    #[arg(long)]
    input: PathBuf,

    /// Disable the column cache.
    #[arg(long)]
    no_column_cache: bool,

    /// Maximum number of cached schemas.
    #[arg(long)]
    cache_capacity: Option<usize>,

    /// Place outputs on CUDA device 0.
    #[arg(long)]
    gpu: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct Request {
    questions: Vec<String>,
    histories: Vec<Vec<String>>,
    schemas: Vec<Vec<Vec<String>>>,
}

fn run<B: EmbeddingBackend>(
    embedder: &mut BatchEmbedder<B>,
    request: &Request,
) -> Result<(), Box<dyn std::error::Error>> {
    if !request.questions.is_empty() {
        let start = Instant::now();
        let tokens = embedder.embed(&request.questions, false)?;
        let mean = embedder.embed(&request.questions, true)?;
        info!(
            "Questions: tokens {:?}, mean {:?}, lengths {:?} ({:.1?})",
            tokens.embeddings.dims(),
            mean.embeddings.dims(),
            tokens.lengths,
            start.elapsed()
        );
    }

    if !request.histories.is_empty() {
        let start = Instant::now();
        let history = embedder.embed_history(&request.histories)?;
        info!(
            "Histories: {:?}, lengths {:?} ({:.1?})",
            history.embeddings.dims(),
            history.lengths,
            start.elapsed()
        );
    }

    if !request.schemas.is_empty() {
        for pass in 1..=2 {
            let start = Instant::now();
            let columns = embedder.embed_columns(&request.schemas)?;
            info!(
                "Columns (pass {}): {:?}, columns {:?}, name lengths {:?} ({:.1?})",
                pass,
                columns.embeddings.dims(),
                columns.column_counts,
                columns.name_lengths,
                start.elapsed()
            );
        }
        let cache = embedder.column_cache();
        info!(
            "Column cache: {} entries, {} hits, {} misses",
            cache.len(),
            cache.hits(),
            cache.misses()
        );
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let request: Request = serde_json::from_str(&fs::read_to_string(&args.input)?)?;
    info!(
        "Request: {} questions, {} histories, {} schemas",
        request.questions.len(),
        request.histories.len(),
        request.schemas.len()
    );

    let mut options = EmbeddingOptions::default()
        .with_column_cache(!args.no_column_cache)
        .with_gpu(args.gpu);
    if let Some(capacity) = args.cache_capacity {
        options = options.with_column_cache_capacity(capacity);
    }

    match args.backend {
        Backend::Glove => {
            let path = args
                .vectors
                .as_deref()
                .ok_or("--vectors is required for the glove backend")?;
            let mut embedder = BatchEmbedder::glove(path, args.dim, options)?;
            run(&mut embedder, &request)
        }
        Backend::RemoteWord => {
            let remote = RemoteEmbedder::new(RemoteConfig::from_env()?.with_dim(args.dim))?;
            let mut embedder = BatchEmbedder::external_word(remote, options)?;
            run(&mut embedder, &request)
        }
        Backend::RemoteSentence => {
            let remote = RemoteEmbedder::new(RemoteConfig::from_env()?.with_dim(args.dim))?;
            let mut embedder = BatchEmbedder::external_sentence(remote, options)?;
            run(&mut embedder, &request)
        }
        Backend::Bert => {
            let mut config = BertConfig::default();
            if args.gpu {
                config = config.with_cuda_device(0);
            }
            let bert = BertEmbedder::new(config)?;
            let mut embedder = BatchEmbedder::external_sentence(bert, options)?;
            run(&mut embedder, &request)
        }
    }
}
