use std::collections::BTreeMap;

/// Metadata reported by the server once a result stream reaches its end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySummary {
    /// Query type as reported by the server (`r`, `w`, `rw`, `s`), if any
    pub query_type: Option<String>,
    /// Update counters such as `nodes-created`
    pub counters: BTreeMap<String, i64>,
    /// Number of records the client read from the stream
    pub records_read: u64,
}

impl QuerySummary {
    #[must_use]
    pub fn counter(&self, name: &str) -> i64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub(crate) fn with_records_read(mut self, records_read: u64) -> Self {
        self.records_read = records_read;
        self
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Bookmark identifying the committed state, for causal chaining of later transactions
    pub bookmark: Option<String>,
}
