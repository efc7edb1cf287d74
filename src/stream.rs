use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TxnMiddlewareError;
use crate::results::{QuerySummary, Record, build_key_index};
use crate::transaction::Transaction;
use crate::transport::{Fetched, QueryHandle, StreamHandle};
use crate::types::Value;

#[derive(Debug)]
enum StreamState {
    Active,
    Done(QuerySummary),
    Failed(TxnMiddlewareError),
}

/// Lazy, forward-only sequence of records produced by [`Transaction::execute`].
///
/// The stream mutably borrows its transaction, so it cannot outlive it and the transaction
/// cannot be finalized while the stream is in use. A stream dropped before its end is
/// remembered by the transaction and handled at commit.
pub struct ResultStream<'tx> {
    tx: &'tx mut Transaction,
    handle: StreamHandle,
    keys: Arc<Vec<String>>,
    key_index: Arc<HashMap<String, usize>>,
    current: Option<Record>,
    rows_read: u64,
    state: StreamState,
}

impl<'tx> ResultStream<'tx> {
    pub(crate) fn new(tx: &'tx mut Transaction, reply: QueryHandle) -> Self {
        let key_index = Arc::new(build_key_index(&reply.keys));
        Self {
            tx,
            handle: reply.stream,
            keys: Arc::new(reply.keys),
            key_index,
            current: None,
            rows_read: 0,
            state: StreamState::Active,
        }
    }

    /// Pull the next record.
    ///
    /// Returns `Ok(true)` when a record is available, `Ok(false)` at the end of the stream (and on
    /// every call after that).
    ///
    /// # Errors
    /// Returns the server's error when the stream fails mid-way; the error is recorded on the
    /// transaction and returned again by every later call. Returns `InvalidState` if the
    /// connection has been destroyed.
    pub async fn advance(&mut self) -> Result<bool, TxnMiddlewareError> {
        match &self.state {
            StreamState::Done(_) => return Ok(false),
            StreamState::Failed(err) => return Err(err.clone()),
            StreamState::Active => {}
        }
        self.current = None;
        self.tx.check_usable()?;

        let shared = Arc::clone(self.tx.shared());
        let res = self.tx.call(shared.transport.fetch_next(self.handle)).await;
        match res {
            Ok(Fetched::Record(values)) => {
                self.current = Some(Record::with_index(
                    Arc::clone(&self.keys),
                    Arc::clone(&self.key_index),
                    values,
                ));
                self.rows_read += 1;
                Ok(true)
            }
            Ok(Fetched::End(summary)) => {
                self.finish(summary);
                Ok(false)
            }
            Err(err) => {
                self.tx.stream_closed(self.handle);
                let err = self.tx.absorb_error(err).await;
                self.state = StreamState::Failed(err.clone());
                Err(err)
            }
        }
    }

    /// Column value of the current record.
    ///
    /// # Errors
    /// Returns `InvalidState` unless the last [`advance`](Self::advance) returned `true`, if the
    /// index is out of range, or if the connection has been destroyed.
    pub fn read_column(&self, index: usize) -> Result<&Value, TxnMiddlewareError> {
        if !self.tx.connection_open() {
            return Err(TxnMiddlewareError::invalid_state(
                "connection has been destroyed",
            ));
        }
        let record = self.current.as_ref().ok_or_else(|| {
            TxnMiddlewareError::invalid_state("no current record; advance the stream first")
        })?;
        record.get_by_index(index).ok_or_else(|| {
            TxnMiddlewareError::invalid_state(format!(
                "column index {index} out of range for {} column(s)",
                record.len()
            ))
        })
    }

    /// Column value of the current record, by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.current.as_ref().and_then(|record| record.get(key))
    }

    #[must_use]
    pub fn current(&self) -> Option<&Record> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    #[must_use]
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Summary reported at the end of the stream, once reached.
    #[must_use]
    pub fn summary(&self) -> Option<&QuerySummary> {
        match &self.state {
            StreamState::Done(summary) => Some(summary),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self.state, StreamState::Done(_))
    }

    /// Advance and take an owned copy of the record.
    ///
    /// # Errors
    /// Same as [`advance`](Self::advance).
    pub async fn next_record(&mut self) -> Result<Option<Record>, TxnMiddlewareError> {
        if self.advance().await? {
            Ok(self.current.clone())
        } else {
            Ok(None)
        }
    }

    /// Drain the stream to its end and return the summary.
    ///
    /// # Errors
    /// Same as [`advance`](Self::advance).
    pub async fn consume(mut self) -> Result<QuerySummary, TxnMiddlewareError> {
        while self.advance().await? {}
        Ok(self.take_summary())
    }

    /// Ask the server to drop the remaining records without transferring them.
    ///
    /// # Errors
    /// Returns the recorded error, `InvalidState` if the connection has been destroyed, or the
    /// transport's error (recorded on the transaction).
    pub async fn discard(mut self) -> Result<QuerySummary, TxnMiddlewareError> {
        match &self.state {
            StreamState::Done(_) => return Ok(self.take_summary()),
            StreamState::Failed(err) => return Err(err.clone()),
            StreamState::Active => {}
        }
        self.current = None;
        self.tx.check_usable()?;

        let shared = Arc::clone(self.tx.shared());
        let res = self.tx.call(shared.transport.discard(self.handle)).await;
        self.tx.stream_closed(self.handle);
        let summary = self.tx.settle(res).await?;
        self.finish(summary);
        Ok(self.take_summary())
    }

    fn finish(&mut self, summary: QuerySummary) {
        self.current = None;
        self.tx.stream_closed(self.handle);
        self.state = StreamState::Done(summary.with_records_read(self.rows_read));
    }

    fn take_summary(&mut self) -> QuerySummary {
        match std::mem::replace(&mut self.state, StreamState::Done(QuerySummary::default())) {
            StreamState::Done(summary) => summary,
            other => {
                self.state = other;
                QuerySummary::default()
            }
        }
    }
}

impl std::fmt::Debug for ResultStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("stream", &self.handle)
            .field("keys", &self.keys)
            .field("rows_read", &self.rows_read)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
