//! Static vocabulary table for pretrained word vectors (GloVe text format).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, info};

use crate::common::{EmbeddingError, PADDING_IDX, Result, UNKNOWN_TOKEN, VocabIdx};

/// Word → index map plus a dense row-major `[num_embeddings, embedding_dim]` matrix.
///
/// Row 0 is always [`UNKNOWN_TOKEN`] with a zero vector. Retained words get
/// contiguous indices starting at 1, in source order.
#[derive(Debug, Clone)]
pub struct VocabularyTable {
    word2idx: HashMap<String, VocabIdx>,
    /// Flat `[num_embeddings * embedding_dim]` f32 values.
    vectors: Vec<f32>,
    embedding_dim: usize,
}

/// Accumulates entries under the load rules: exact dimension, first occurrence wins.
struct TableBuilder {
    word2idx: HashMap<String, VocabIdx>,
    vectors: Vec<f32>,
    embedding_dim: usize,
    skipped: usize,
}

impl TableBuilder {
    fn new(embedding_dim: usize) -> Result<Self> {
        if embedding_dim == 0 {
            return Err(EmbeddingError::ZeroDimension);
        }
        let mut word2idx = HashMap::new();
        word2idx.insert(UNKNOWN_TOKEN.to_string(), PADDING_IDX);
        Ok(Self {
            word2idx,
            vectors: vec![0.0; embedding_dim],
            embedding_dim,
            skipped: 0,
        })
    }

    fn push(&mut self, token: &str, vector: &[f32]) {
        if vector.len() != self.embedding_dim {
            self.skipped += 1;
            return;
        }
        let next = VocabIdx((self.vectors.len() / self.embedding_dim) as u32);
        match self.word2idx.entry(token.to_string()) {
            Entry::Occupied(_) => self.skipped += 1,
            Entry::Vacant(slot) => {
                slot.insert(next);
                self.vectors.extend_from_slice(vector);
            }
        }
    }

    /// Parse one `token v1 ... vD` line. Unparseable values drop the line.
    fn push_line(&mut self, line: &str) {
        let mut fields = line.split_whitespace();
        let Some(token) = fields.next() else {
            return;
        };
        let parsed: std::result::Result<Vec<f32>, _> = fields.map(str::parse::<f32>).collect();
        match parsed {
            Ok(vector) => self.push(token, &vector),
            Err(_) => self.skipped += 1,
        }
    }

    fn finish(self, source_name: &str) -> Result<VocabularyTable> {
        // Only the unknown row means nothing usable was read.
        if self.vectors.len() == self.embedding_dim {
            return Err(EmbeddingError::EmptyVocabulary {
                source_name: source_name.to_string(),
                dim: self.embedding_dim,
            });
        }
        if self.skipped > 0 {
            debug!("Skipped {} entries from {}", self.skipped, source_name);
        }
        Ok(VocabularyTable {
            word2idx: self.word2idx,
            vectors: self.vectors,
            embedding_dim: self.embedding_dim,
        })
    }
}

impl VocabularyTable {
    /// Load a whitespace-separated vector file, keeping only rows of `embedding_dim` values.
    ///
    /// A missing, unreadable, or effectively empty file is an error.
    pub fn load(path: &Path, embedding_dim: usize) -> Result<Self> {
        info!("Loading word vectors from {}", path.display());
        let io_err = |source| EmbeddingError::VocabIo {
            path: path.to_path_buf(),
            source,
        };

        let mut builder = TableBuilder::new(embedding_dim)?;
        let file = File::open(path).map_err(io_err)?;
        for line in BufReader::new(file).lines() {
            builder.push_line(&line.map_err(io_err)?);
        }

        let table = builder.finish(&path.display().to_string())?;
        info!(
            "Loaded {} word vectors of dimension {}",
            table.num_embeddings() - 1,
            embedding_dim
        );
        Ok(table)
    }

    /// Build a table from in-memory `(token, vector)` pairs, under the same rules as [`Self::load`].
    pub fn from_entries<I, S>(embedding_dim: usize, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f32>)>,
        S: AsRef<str>,
    {
        let mut builder = TableBuilder::new(embedding_dim)?;
        for (token, vector) in entries {
            builder.push(token.as_ref(), &vector);
        }
        builder.finish("in-memory entries")
    }

    /// Number of rows, including the unknown row.
    pub fn num_embeddings(&self) -> usize {
        self.vectors.len() / self.embedding_dim
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Index of `token`, or [`PADDING_IDX`] when it is not in the table.
    pub fn index(&self, token: &str) -> VocabIdx {
        self.word2idx.get(token).copied().unwrap_or(PADDING_IDX)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.word2idx.contains_key(token)
    }

    pub fn word2idx(&self) -> &HashMap<String, VocabIdx> {
        &self.word2idx
    }

    /// Look up an embedding vector by index.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn get(&self, idx: VocabIdx) -> &[f32] {
        let i = idx.as_usize();
        assert!(
            i < self.num_embeddings(),
            "VocabIdx {i} out of bounds (num_embeddings = {})",
            self.num_embeddings(),
        );
        let start = i * self.embedding_dim;
        &self.vectors[start..start + self.embedding_dim]
    }

    /// The whole matrix, row-major.
    pub fn as_slice(&self) -> &[f32] {
        &self.vectors
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_vectors(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn test_load_cat_dog() {
        let file = write_vectors(&["cat 0.1 0.2 0.3", "dog 0.4 0.5 0.6"]);
        let table = VocabularyTable::load(file.path(), 3).unwrap();

        assert_eq!(table.num_embeddings(), 3);
        assert_eq!(table.embedding_dim(), 3);
        assert_ne!(table.index("cat"), table.index("dog"));
        assert_eq!(table.word2idx().get(UNKNOWN_TOKEN), Some(&PADDING_IDX));
        assert_eq!(table.get(PADDING_IDX), &[0.0, 0.0, 0.0]);
        assert_eq!(table.get(table.index("dog")), &[0.4, 0.5, 0.6]);
    }

    #[test]
    fn test_load_skips_bad_lines_and_duplicates() {
        let file = write_vectors(&[
            "cat 0.1 0.2 0.3",
            "short 1.0 2.0",
            "long 1.0 2.0 3.0 4.0",
            "nan_word 1.0 abc 3.0",
            "",
            "cat 9.0 9.0 9.0",
            "dog 0.4 0.5 0.6",
        ]);
        let table = VocabularyTable::load(file.path(), 3).unwrap();

        assert_eq!(table.num_embeddings(), 3);
        assert!(!table.contains("short"));
        assert!(!table.contains("long"));
        assert!(!table.contains("nan_word"));
        assert_eq!(table.get(table.index("cat")), &[0.1, 0.2, 0.3]);
        // Indices stay contiguous even though lines were skipped.
        assert_eq!(table.index("cat"), VocabIdx(1));
        assert_eq!(table.index("dog"), VocabIdx(2));
    }

    #[test]
    fn test_every_valid_token_round_trips() {
        let file = write_vectors(&["a 1 0", "b 0 1", "c 1 1"]);
        let table = VocabularyTable::load(file.path(), 2).unwrap();
        for (token, expected) in [("a", [1.0f32, 0.0]), ("b", [0.0, 1.0]), ("c", [1.0, 1.0])] {
            assert!(table.contains(token));
            assert_eq!(table.get(table.index(token)), &expected);
        }
        assert_eq!(table.index("zebra"), PADDING_IDX);
        assert_eq!(table.as_slice().len(), table.num_embeddings() * 2);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = VocabularyTable::load(&dir.path().join("absent.txt"), 3).unwrap_err();
        assert!(matches!(err, EmbeddingError::VocabIo { .. }));
    }

    #[test]
    fn test_empty_file_is_fatal() {
        let file = write_vectors(&[]);
        let err = VocabularyTable::load(file.path(), 3).unwrap_err();
        assert!(matches!(err, EmbeddingError::EmptyVocabulary { dim: 3, .. }));

        let file = write_vectors(&["cat 0.1 0.2"]);
        assert!(VocabularyTable::load(file.path(), 3).is_err());
    }

    #[test]
    fn test_from_entries() {
        let table = VocabularyTable::from_entries(
            2,
            [("x", vec![1.0, 2.0]), ("y", vec![3.0]), ("x", vec![5.0, 5.0])],
        )
        .unwrap();
        assert_eq!(table.num_embeddings(), 2);
        assert_eq!(table.get(table.index("x")), &[1.0, 2.0]);
    }

    #[test]
    fn test_zero_dimension_is_fatal() {
        let file = write_vectors(&["cat", "dog"]);
        let err = VocabularyTable::load(file.path(), 0).unwrap_err();
        assert!(matches!(err, EmbeddingError::ZeroDimension));

        let entries: [(&str, Vec<f32>); 1] = [("cat", Vec::new())];
        assert!(matches!(
            VocabularyTable::from_entries(0, entries),
            Err(EmbeddingError::ZeroDimension)
        ));
    }
}
