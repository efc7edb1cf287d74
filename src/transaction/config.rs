use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::types::Value;

/// Whether the transaction only reads, so the server may route it accordingly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    #[default]
    Write,
}

/// What `commit` does with result streams that were neither drained nor discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnconsumedStreams {
    /// Ask the transport to discard the remaining records, then commit.
    #[default]
    Discard,
    /// Refuse to commit with `StreamNotExhausted`.
    Reject,
}

/// Per-transaction options.
#[derive(Debug, Clone, Default)]
pub struct TxConfig {
    /// Bookmarks the server must have applied before the transaction starts
    pub bookmarks: Vec<String>,
    /// Server-side timeout for the whole transaction
    pub timeout: Option<Duration>,
    /// Metadata attached to the transaction for server-side monitoring
    pub metadata: BTreeMap<String, Value>,
    pub access_mode: AccessMode,
    /// Target database; `None` uses the server default
    pub database: Option<String>,
    pub unconsumed: UnconsumedStreams,
    /// Cancelling the token aborts the in-flight request and rolls the transaction back
    pub cancellation: Option<CancellationToken>,
}

impl TxConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.access_mode = AccessMode::Read;
        self
    }

    #[must_use]
    pub fn with_bookmark(mut self, bookmark: impl Into<String>) -> Self {
        self.bookmarks.push(bookmark.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    #[must_use]
    pub fn with_unconsumed(mut self, policy: UnconsumedStreams) -> Self {
        self.unconsumed = policy;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}
