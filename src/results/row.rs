use std::collections::HashMap;
use std::sync::Arc;

use crate::types::Value;

/// One record produced by a result stream.
///
/// Column keys are shared by every record of the same stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// The column keys for this record (shared across the stream)
    pub keys: Arc<Vec<String>>,
    /// The values for this record, in key order
    pub values: Vec<Value>,
    // Key -> position lookup, shared across the stream
    #[doc(hidden)]
    pub(crate) key_index: Arc<HashMap<String, usize>>,
}

impl Record {
    /// Create a new record
    ///
    /// # Arguments
    ///
    /// * `keys` - The column keys
    /// * `values` - The values for this record
    #[must_use]
    pub fn new(keys: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        let key_index = Arc::new(build_key_index(&keys));
        Self::with_index(keys, key_index, values)
    }

    pub(crate) fn with_index(
        keys: Arc<Vec<String>>,
        key_index: Arc<HashMap<String, usize>>,
        values: Vec<Value>,
    ) -> Self {
        Self {
            keys,
            values,
            key_index,
        }
    }

    /// Get the index of a column by key
    #[must_use]
    pub fn key_position(&self, key: &str) -> Option<usize> {
        if let Some(&idx) = self.key_index.get(key) {
            return Some(idx);
        }
        self.keys.iter().position(|k| k == key)
    }

    /// Get a value from the record by column key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.key_position(key).and_then(|idx| self.values.get(idx))
    }

    /// Get a value from the record by column index
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub(crate) fn build_key_index(keys: &[String]) -> HashMap<String, usize> {
    keys.iter()
        .enumerate()
        .map(|(i, key)| (key.clone(), i))
        .collect()
}
