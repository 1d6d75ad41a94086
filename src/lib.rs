use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod backend;
pub mod cache;
pub mod common;
pub mod dynamic;
pub mod embedder;
pub mod placement;
pub mod tokenizer;
pub mod vocab;

#[cfg(test)]
mod testing;

pub use backend::{EmbeddingBackend, ExternalBackend, StaticTable};
pub use cache::{CachedColumns, ColumnCache};
pub use common::{ColumnBatch, EmbeddingError, PaddedBatch, Result, VocabIdx};
pub use dynamic::DynamicVocabulary;
pub use embedder::{BatchEmbedder, EmbeddingOptions};
pub use placement::Placement;
pub use tokenizer::{Tokenizer, WhitespaceTokenizer, WordTokenizer};
pub use vocab::VocabularyTable;
