//! Transactions and their first-error bookkeeping.
//!
//! Once an operation fails, the error is recorded on the transaction and every later operation
//! (except [`Transaction::rollback`]) returns that same error without contacting the server.
//! All state changes go through [`Transaction::transition`].

mod config;

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionShared};
use crate::error::TxnMiddlewareError;
use crate::results::CommitSummary;
use crate::retry::{RetryBinding, RetryController};
use crate::stream::ResultStream;
use crate::transport::{SessionToken, StreamHandle};
use crate::tx_outcome::AttemptOutcome;
use crate::types::Params;

pub use config::{AccessMode, TxConfig, UnconsumedStreams};

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum TxState {
    /// Usable; `error` holds the first failure, after which only rollback is allowed.
    Open { error: Option<TxnMiddlewareError> },
    Committed,
    RolledBack,
}

enum TxEvent {
    Failed(TxnMiddlewareError),
    CommitUnknown(TxnMiddlewareError),
    Committed,
    RolledBack,
}

/// Unit of work on a [`Connection`].
///
/// Dropping an open transaction rolls it back in the background (when a tokio runtime is
/// available) and reports the attempt as abandoned to a bound retry controller.
pub struct Transaction {
    conn: Arc<ConnectionShared>,
    session: SessionToken,
    config: TxConfig,
    state: TxState,
    binding: Option<RetryBinding>,
    pending_streams: Vec<StreamHandle>,
    bookmark: Option<String>,
    holds_slot: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("connection", &self.conn.id)
            .field("session", &self.session)
            .field("state", &self.state)
            .field("attempt", &self.attempt())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Open a transaction, optionally bound to `controller`.
    ///
    /// When bound, a failure to open is reported to the controller as the outcome of the
    /// attempt, so the caller can consult [`RetryController::should_retry`].
    ///
    /// # Errors
    /// Returns `InvalidState` if the controller cannot be bound or the connection already has a
    /// live transaction, `ConnectionError` if the connection is closed, or the transport's error
    /// if the server refuses to open the transaction.
    pub async fn begin(
        conn: &Connection,
        config: TxConfig,
        controller: Option<&mut RetryController>,
    ) -> Result<Self, TxnMiddlewareError> {
        let shared = Arc::clone(conn.shared());
        let mut binding = controller.map(RetryController::bind).transpose()?;

        let admitted = if shared.is_open() {
            shared.claim_slot()
        } else {
            Err(TxnMiddlewareError::ConnectionError(
                "connection is closed".into(),
            ))
        };
        if let Err(err) = admitted {
            if let Some(binding) = binding.as_mut() {
                binding.report(AttemptOutcome::Failed(err.clone()));
            }
            return Err(err);
        }

        let opened = cancellable(
            config.cancellation.as_ref(),
            shared.request(shared.transport.open_transaction(&config)),
        )
        .await;

        match opened {
            Ok(session) => {
                shared.counters.transaction_begun();
                tracing::debug!(
                    connection = shared.id,
                    session = session.0,
                    attempt = binding.as_ref().map(RetryBinding::attempt),
                    "transaction begun"
                );
                Ok(Self {
                    conn: shared,
                    session,
                    config,
                    state: TxState::Open { error: None },
                    binding,
                    pending_streams: Vec::new(),
                    bookmark: None,
                    holds_slot: true,
                })
            }
            Err(err) => {
                shared.free_slot();
                tracing::warn!(connection = shared.id, error = %err, "failed to begin transaction");
                if let Some(binding) = binding.as_mut() {
                    binding.report(AttemptOutcome::Failed(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// Run a parameterized query and return a lazy stream over its records.
    ///
    /// # Errors
    /// Returns the recorded error if an earlier operation failed (without contacting the server),
    /// `InvalidState` if the transaction is finalized or its connection destroyed, or the
    /// transport's error, which is then recorded.
    pub async fn execute(
        &mut self,
        query: &str,
        params: Params,
    ) -> Result<ResultStream<'_>, TxnMiddlewareError> {
        self.check_usable()?;
        let shared = Arc::clone(&self.conn);
        let res = self
            .call(shared.transport.run_query(self.session, query, &params))
            .await;
        let handle = self.settle(res).await?;
        tracing::debug!(
            connection = self.conn.id,
            session = self.session.0,
            stream = handle.stream.0,
            "query started"
        );
        self.pending_streams.push(handle.stream);
        Ok(ResultStream::new(self, handle))
    }

    /// Commit the transaction.
    ///
    /// Streams that were neither drained nor discarded are handled per
    /// [`TxConfig::unconsumed`]. On success a bound retry controller is released. On failure the
    /// transaction stays open with the error recorded; roll it back (or drop it) afterwards.
    /// A lost connection or a client-side timeout during the commit request is reported to a
    /// bound controller as [`AttemptOutcome::CommitUnknown`], which is never retried.
    ///
    /// # Errors
    /// Returns the recorded error, `StreamNotExhausted` under [`UnconsumedStreams::Reject`],
    /// `InvalidState` if already finalized, or the transport's error.
    pub async fn commit(&mut self) -> Result<CommitSummary, TxnMiddlewareError> {
        self.check_usable()?;
        let shared = Arc::clone(&self.conn);

        if !self.pending_streams.is_empty() {
            match self.config.unconsumed {
                UnconsumedStreams::Reject => {
                    let err = TxnMiddlewareError::StreamNotExhausted(format!(
                        "{} result stream(s) still open at commit",
                        self.pending_streams.len()
                    ));
                    return Err(self.fail(err));
                }
                UnconsumedStreams::Discard => {
                    for stream in std::mem::take(&mut self.pending_streams) {
                        let res = self.call(shared.transport.discard(stream)).await;
                        self.settle(res).await?;
                    }
                }
            }
        }

        let summary = match self.call(shared.transport.commit(self.session)).await {
            Ok(summary) => summary,
            Err(err) if err.leaves_commit_unknown() => {
                self.transition(TxEvent::CommitUnknown(err.clone()));
                return Err(err);
            }
            Err(err) => return Err(self.absorb_error(err).await),
        };
        self.bookmark.clone_from(&summary.bookmark);
        self.transition(TxEvent::Committed);
        tracing::debug!(
            connection = self.conn.id,
            session = self.session.0,
            bookmark = ?self.bookmark,
            "transaction committed"
        );
        Ok(summary)
    }

    /// Roll the transaction back. Allowed from any open state, including after a failure.
    ///
    /// # Errors
    /// Returns `InvalidState` if the transaction is already finalized or its connection destroyed,
    /// or the transport's error (the transaction is finalized regardless).
    pub async fn rollback(&mut self) -> Result<(), TxnMiddlewareError> {
        if !self.is_open() {
            return Err(TxnMiddlewareError::invalid_state(
                "transaction is already finalized",
            ));
        }
        self.conn.ensure_open()?;
        self.pending_streams.clear();

        let res = self
            .conn
            .request(self.conn.transport.rollback(self.session))
            .await;
        if let Err(err) = &res {
            self.transition(TxEvent::Failed(err.clone()));
        }
        self.transition(TxEvent::RolledBack);
        tracing::debug!(
            connection = self.conn.id,
            session = self.session.0,
            ok = res.is_ok(),
            "transaction rolled back"
        );
        res
    }

    #[must_use]
    pub fn state(&self) -> &TxState {
        &self.state
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, TxState::Open { .. })
    }

    /// First error recorded by this transaction.
    #[must_use]
    pub fn last_error(&self) -> Option<&TxnMiddlewareError> {
        match &self.state {
            TxState::Open { error } => error.as_ref(),
            _ => None,
        }
    }

    /// Bookmark returned by a successful commit.
    #[must_use]
    pub fn bookmark(&self) -> Option<&str> {
        self.bookmark.as_deref()
    }

    #[must_use]
    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    #[must_use]
    pub fn session(&self) -> SessionToken {
        self.session
    }

    /// 1-based attempt number when bound to a retry controller.
    #[must_use]
    pub fn attempt(&self) -> Option<u32> {
        self.binding.as_ref().map(RetryBinding::attempt)
    }

    /// Ok if a new request may be sent; otherwise the error to short-circuit with.
    pub(crate) fn check_usable(&self) -> Result<(), TxnMiddlewareError> {
        match &self.state {
            TxState::Committed | TxState::RolledBack => Err(TxnMiddlewareError::invalid_state(
                "transaction is already finalized",
            )),
            TxState::Open { error } => {
                self.conn.ensure_open()?;
                match error {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                }
            }
        }
    }

    pub(crate) fn connection_open(&self) -> bool {
        self.conn.is_open()
    }

    pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
        &self.conn
    }

    pub(crate) fn stream_closed(&mut self, stream: StreamHandle) {
        self.pending_streams.retain(|s| *s != stream);
    }

    /// Await a transport request under the request timeout and the cancellation token.
    pub(crate) async fn call<T, F>(&self, fut: F) -> Result<T, TxnMiddlewareError>
    where
        F: Future<Output = Result<T, TxnMiddlewareError>>,
    {
        cancellable(self.config.cancellation.as_ref(), self.conn.request(fut)).await
    }

    /// Record a failed request; a cancellation also closes the transaction.
    pub(crate) async fn settle<T>(
        &mut self,
        res: Result<T, TxnMiddlewareError>,
    ) -> Result<T, TxnMiddlewareError> {
        match res {
            Ok(value) => Ok(value),
            Err(err) => Err(self.absorb_error(err).await),
        }
    }

    pub(crate) async fn absorb_error(&mut self, err: TxnMiddlewareError) -> TxnMiddlewareError {
        if err == TxnMiddlewareError::Cancelled {
            self.close_cancelled().await;
            err
        } else {
            self.fail(err)
        }
    }

    fn fail(&mut self, err: TxnMiddlewareError) -> TxnMiddlewareError {
        self.transition(TxEvent::Failed(err.clone()));
        err
    }

    async fn close_cancelled(&mut self) {
        self.transition(TxEvent::Failed(TxnMiddlewareError::Cancelled));
        self.pending_streams.clear();
        let res = self
            .conn
            .request(self.conn.transport.rollback(self.session))
            .await;
        if let Err(err) = res {
            tracing::warn!(
                connection = self.conn.id,
                session = self.session.0,
                error = %err,
                "rollback after cancellation failed"
            );
        }
        self.transition(TxEvent::RolledBack);
    }

    /// The single place where `state` changes. Finalized states are terminal.
    fn transition(&mut self, event: TxEvent) {
        let TxState::Open { error } = &self.state else {
            return;
        };
        let clean = error.is_none();

        match event {
            TxEvent::Failed(err) => {
                if clean {
                    tracing::warn!(
                        connection = self.conn.id,
                        session = self.session.0,
                        error = %err,
                        "transaction failed"
                    );
                    self.report(AttemptOutcome::Failed(err.clone()));
                    self.state = TxState::Open { error: Some(err) };
                }
            }
            TxEvent::CommitUnknown(err) => {
                if clean {
                    tracing::warn!(
                        connection = self.conn.id,
                        session = self.session.0,
                        error = %err,
                        "commit outcome unknown"
                    );
                    self.report(AttemptOutcome::CommitUnknown(err.clone()));
                    self.state = TxState::Open { error: Some(err) };
                }
            }
            TxEvent::Committed => {
                self.state = TxState::Committed;
                self.conn.counters.transaction_committed();
                self.report(AttemptOutcome::Committed);
                self.release_slot();
            }
            TxEvent::RolledBack => {
                self.state = TxState::RolledBack;
                self.conn.counters.transaction_rolled_back();
                if clean {
                    self.report(AttemptOutcome::RolledBack);
                }
                self.release_slot();
            }
        }
    }

    fn report(&mut self, outcome: AttemptOutcome) {
        if let Some(binding) = self.binding.as_mut() {
            binding.report(outcome);
        }
    }

    fn release_slot(&mut self) {
        if self.holds_slot {
            self.holds_slot = false;
            self.conn.free_slot();
            self.conn.counters.transaction_ended();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.is_open() {
            return;
        }
        let rolling_back = self.conn.is_open()
            && match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let shared = Arc::clone(&self.conn);
                    let session = self.session;
                    handle.spawn(async move {
                        let res = shared.request(shared.transport.rollback(session)).await;
                        if let Err(err) = res {
                            tracing::warn!(
                                connection = shared.id,
                                session = session.0,
                                error = %err,
                                "rollback of dropped transaction failed"
                            );
                        }
                    });
                    true
                }
                Err(_) => false,
            };
        tracing::debug!(
            connection = self.conn.id,
            session = self.session.0,
            rolling_back,
            "open transaction dropped"
        );
        self.report(AttemptOutcome::Abandoned);
        self.state = TxState::RolledBack;
        if rolling_back {
            self.conn.counters.transaction_rolled_back();
        }
        self.release_slot();
    }
}

async fn cancellable<T, F>(
    token: Option<&CancellationToken>,
    fut: F,
) -> Result<T, TxnMiddlewareError>
where
    F: Future<Output = Result<T, TxnMiddlewareError>>,
{
    match token {
        Some(token) => {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(TxnMiddlewareError::Cancelled),
                res = fut => res,
            }
        }
        None => fut.await,
    }
}
