//! Memoized column-name embeddings, one entry per schema.

use candle_core::Tensor;
use indexmap::IndexMap;
use tracing::debug;

use crate::common::Result;

/// Embedded columns of one schema, as computed under some batch's padding.
#[derive(Debug, Clone)]
pub struct CachedColumns {
    /// Host tensor `[columns, tokens, dim]`.
    pub embeddings: Tensor,
    /// Token count of each of the `columns` slots.
    pub name_lengths: Vec<usize>,
}

/// Cache of [`CachedColumns`] keyed by the serialized joined-column list.
///
/// Unbounded unless a capacity is given, in which case the least recently
/// used entry is evicted first.
#[derive(Debug, Default)]
pub struct ColumnCache {
    /// Ordered from least to most recently used.
    entries: IndexMap<String, CachedColumns>,
    capacity: Option<usize>,
    hits: u64,
    misses: u64,
}

impl ColumnCache {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    /// Cache key for a schema whose columns have been joined into one string each.
    pub fn key<S: AsRef<str>>(joined_columns: &[S]) -> Result<String> {
        let names: Vec<&str> = joined_columns.iter().map(AsRef::as_ref).collect();
        Ok(serde_json::to_string(&names)?)
    }

    pub fn get(&mut self, key: &str) -> Option<&CachedColumns> {
        let Some(index) = self.entries.get_index_of(key) else {
            self.misses += 1;
            return None;
        };
        self.hits += 1;
        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        self.entries.get_index(last).map(|(_, entry)| entry)
    }

    pub fn insert(&mut self, key: String, entry: CachedColumns) {
        self.entries.insert(key, entry);
        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                if let Some((evicted, _)) = self.entries.shift_remove_index(0) {
                    debug!("Evicted column cache entry {}", evicted);
                }
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
