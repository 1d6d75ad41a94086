pub mod bert;
pub mod embedder;

pub use bert::{BertConfig, BertEmbedder};
pub use embedder::{EmbedMode, EmbedderError, ExternalEmbedder, RemoteConfig, RemoteEmbedder};
