//! In-memory transport for tests and benchmarks.
//!
//! [`ScriptedTransport`] answers `RETURN $p AS x`-shaped queries by echoing the parameters back as
//! a single record, serves canned rows registered with [`ScriptedTransport::with_rows`], and lets a
//! test queue failures (or requests that never complete) for the next call of each step.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::config::DriverConfig;
use crate::connection::Connection;
use crate::error::TxnMiddlewareError;
use crate::results::{CommitSummary, QuerySummary};
use crate::transaction::TxConfig;
use crate::transport::{Connector, Fetched, QueryHandle, SessionToken, StreamHandle, Transport};
use crate::types::{Params, Value};

static ECHO_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\$(\w+)\s+AS\s+(\w+)").expect("echo pattern is valid")
});

/// Transport operation, for targeting injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Open,
    Run,
    Fetch,
    Discard,
    Commit,
    Rollback,
}

/// How many times each transport operation was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub open: u64,
    pub run: u64,
    pub fetch: u64,
    pub discard: u64,
    pub commit: u64,
    pub rollback: u64,
    pub close: u64,
}

#[derive(Debug, Clone)]
struct CannedReply {
    keys: Vec<String>,
    rows: Vec<Vec<Value>>,
    summary: QuerySummary,
}

#[derive(Debug)]
struct OpenStream {
    rows: VecDeque<Vec<Value>>,
    summary: QuerySummary,
}

#[derive(Debug, Default)]
struct ScriptState {
    next_id: u64,
    sessions: BTreeSet<u64>,
    streams: HashMap<u64, OpenStream>,
    failures: HashMap<Step, VecDeque<TxnMiddlewareError>>,
    hangs: HashMap<Step, u32>,
    canned: Vec<(String, CannedReply)>,
    calls: CallCounts,
    begun_with: Vec<TxConfig>,
    queries: Vec<String>,
    closed: bool,
}

enum Directive {
    Proceed,
    Fail(TxnMiddlewareError),
    Hang,
}

/// Scriptable stand-in for a server.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connection over this transport with a default configuration.
    ///
    /// # Panics
    /// Never in practice: the default URI is valid.
    #[must_use]
    pub fn connection(self: &Arc<Self>) -> Connection {
        self.connection_with(DriverConfig::new("bolt://localhost"))
            .unwrap_or_else(|e| panic!("scripted connection: {e}"))
    }

    /// Connection over this transport with `config`.
    ///
    /// # Errors
    /// Returns the configuration error, if any.
    pub fn connection_with(self: &Arc<Self>, config: DriverConfig) -> Result<Connection, TxnMiddlewareError> {
        let transport: Arc<dyn Transport> = Arc::clone(self) as Arc<dyn Transport>;
        Connection::from_transport(config, transport)
    }

    /// Fail the next call of `step` with `err`. Queued failures are used in order.
    pub fn fail_next(&self, step: Step, err: TxnMiddlewareError) {
        self.lock().failures.entry(step).or_default().push_back(err);
    }

    /// Fail the next `n` calls of `step` with a transient server error.
    pub fn fail_transient(&self, step: Step, n: usize) {
        for _ in 0..n {
            self.fail_next(step, transient_error());
        }
    }

    /// Make the next call of `step` never complete.
    pub fn hang_next(&self, step: Step) {
        *self.lock().hangs.entry(step).or_default() += 1;
    }

    /// Answer queries containing `fragment` with fixed rows.
    pub fn with_rows(&self, fragment: impl Into<String>, keys: &[&str], rows: Vec<Vec<Value>>) {
        let reply = CannedReply {
            keys: keys.iter().map(|k| (*k).to_string()).collect(),
            rows,
            summary: QuerySummary {
                query_type: Some("r".into()),
                ..QuerySummary::default()
            },
        };
        self.lock().canned.push((fragment.into(), reply));
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Sessions opened and neither committed nor rolled back.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Streams started and neither exhausted nor discarded.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.lock().streams.len()
    }

    /// Configurations passed to every `open_transaction` call, in order.
    #[must_use]
    pub fn begun_with(&self) -> Vec<TxConfig> {
        self.lock().begun_with.clone()
    }

    /// Query texts of every successful `run_query` call, in order.
    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        self.lock().queries.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn directive(state: &mut ScriptState, step: Step) -> Directive {
        if let Some(n) = state.hangs.get_mut(&step)
            && *n > 0
        {
            *n -= 1;
            return Directive::Hang;
        }
        match state.failures.get_mut(&step).and_then(VecDeque::pop_front) {
            Some(err) => Directive::Fail(err),
            None => Directive::Proceed,
        }
    }

    /// Count the call, then decide how to answer it; the lock is released before any await.
    async fn enter(&self, step: Step) -> Result<(), TxnMiddlewareError> {
        let directive = {
            let mut state = self.lock();
            let calls = &mut state.calls;
            match step {
                Step::Open => calls.open += 1,
                Step::Run => calls.run += 1,
                Step::Fetch => calls.fetch += 1,
                Step::Discard => calls.discard += 1,
                Step::Commit => calls.commit += 1,
                Step::Rollback => calls.rollback += 1,
            }
            if state.closed {
                Directive::Fail(TxnMiddlewareError::ConnectionError(
                    "transport is closed".into(),
                ))
            } else {
                Self::directive(&mut state, step)
            }
        };
        match directive {
            Directive::Proceed => Ok(()),
            Directive::Fail(err) => Err(err),
            Directive::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn reply_for(state: &ScriptState, query: &str, params: &Params) -> CannedReply {
        if let Some((_, reply)) = state
            .canned
            .iter()
            .rev()
            .find(|(fragment, _)| query.contains(fragment.as_str()))
        {
            return reply.clone();
        }

        let mut keys = Vec::new();
        let mut row = Vec::new();
        for caps in ECHO_COLUMN.captures_iter(query) {
            keys.push(caps[2].to_string());
            row.push(params.get(&caps[1]).cloned().unwrap_or(Value::Null));
        }
        let rows = if keys.is_empty() { Vec::new() } else { vec![row] };
        CannedReply {
            keys,
            rows,
            summary: QuerySummary {
                query_type: Some("r".into()),
                ..QuerySummary::default()
            },
        }
    }
}

/// Transient error of the kind a busy server reports.
#[must_use]
pub fn transient_error() -> TxnMiddlewareError {
    TxnMiddlewareError::from_server(
        "Neo.TransientError.Transaction.DeadlockDetected",
        "deadlock detected while trying to acquire locks",
    )
}

/// Permanent error of the kind a malformed query produces.
#[must_use]
pub fn query_error() -> TxnMiddlewareError {
    TxnMiddlewareError::from_server("Neo.ClientError.Statement.SyntaxError", "invalid input")
}

fn unknown(what: &str, id: u64) -> TxnMiddlewareError {
    TxnMiddlewareError::from_server(
        "Neo.ClientError.Request.Invalid",
        format!("unknown {what} {id}"),
    )
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open_transaction(&self, config: &TxConfig) -> Result<SessionToken, TxnMiddlewareError> {
        self.enter(Step::Open).await?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.sessions.insert(id);
        state.begun_with.push(config.clone());
        Ok(SessionToken(id))
    }

    async fn run_query(
        &self,
        session: SessionToken,
        query: &str,
        params: &Params,
    ) -> Result<QueryHandle, TxnMiddlewareError> {
        self.enter(Step::Run).await?;
        let mut state = self.lock();
        if !state.sessions.contains(&session.0) {
            return Err(unknown("session", session.0));
        }
        let reply = Self::reply_for(&state, query, params);
        state.next_id += 1;
        let id = state.next_id;
        state.streams.insert(
            id,
            OpenStream {
                rows: reply.rows.into(),
                summary: reply.summary,
            },
        );
        state.queries.push(query.to_string());
        Ok(QueryHandle {
            stream: StreamHandle(id),
            keys: reply.keys,
        })
    }

    async fn fetch_next(&self, stream: StreamHandle) -> Result<Fetched, TxnMiddlewareError> {
        self.enter(Step::Fetch).await?;
        let mut state = self.lock();
        let open = state
            .streams
            .get_mut(&stream.0)
            .ok_or_else(|| unknown("stream", stream.0))?;
        if let Some(row) = open.rows.pop_front() {
            return Ok(Fetched::Record(row));
        }
        let summary = open.summary.clone();
        state.streams.remove(&stream.0);
        Ok(Fetched::End(summary))
    }

    async fn discard(&self, stream: StreamHandle) -> Result<QuerySummary, TxnMiddlewareError> {
        self.enter(Step::Discard).await?;
        let mut state = self.lock();
        state
            .streams
            .remove(&stream.0)
            .map(|open| open.summary)
            .ok_or_else(|| unknown("stream", stream.0))
    }

    async fn commit(&self, session: SessionToken) -> Result<CommitSummary, TxnMiddlewareError> {
        self.enter(Step::Commit).await?;
        let mut state = self.lock();
        if !state.sessions.remove(&session.0) {
            return Err(unknown("session", session.0));
        }
        Ok(CommitSummary {
            bookmark: Some(format!("bm:{}", session.0)),
        })
    }

    async fn rollback(&self, session: SessionToken) -> Result<(), TxnMiddlewareError> {
        self.enter(Step::Rollback).await?;
        self.lock().sessions.remove(&session.0);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.lock();
        state.calls.close += 1;
        state.closed = true;
    }
}

/// Connector handing out one shared [`ScriptedTransport`].
#[derive(Debug)]
pub struct ScriptedConnector {
    transport: Arc<ScriptedTransport>,
    refuse: Mutex<Option<TxnMiddlewareError>>,
    delay: Option<Duration>,
}

impl ScriptedConnector {
    #[must_use]
    pub fn new(transport: Arc<ScriptedTransport>) -> Self {
        Self {
            transport,
            refuse: Mutex::new(None),
            delay: None,
        }
    }

    /// Refuse the next connect with `err`.
    #[must_use]
    pub fn refusing(self, err: TxnMiddlewareError) -> Self {
        *self.refuse.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(err);
        self
    }

    /// Take `delay` to connect.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _config: &DriverConfig) -> Result<Arc<dyn Transport>, TxnMiddlewareError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let refused = self
            .refuse
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(err) = refused {
            return Err(err);
        }
        Ok(Arc::clone(&self.transport) as Arc<dyn Transport>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_parameters() {
        let transport = ScriptedTransport::new();
        let session = transport.open_transaction(&TxConfig::default()).await.unwrap();
        let handle = transport
            .run_query(session, "RETURN $p AS x, $q AS y", &Params::new().with("p", 7))
            .await
            .unwrap();
        assert_eq!(handle.keys, vec!["x", "y"]);
        assert_eq!(
            transport.fetch_next(handle.stream).await.unwrap(),
            Fetched::Record(vec![Value::Integer(7), Value::Null])
        );
        assert!(matches!(
            transport.fetch_next(handle.stream).await.unwrap(),
            Fetched::End(_)
        ));
        transport.commit(session).await.unwrap();
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn queued_failures_are_consumed_in_order() {
        let transport = ScriptedTransport::new();
        transport.fail_next(Step::Open, query_error());
        assert_eq!(
            transport.open_transaction(&TxConfig::default()).await,
            Err(query_error())
        );
        assert!(transport.open_transaction(&TxConfig::default()).await.is_ok());
        assert_eq!(transport.calls().open, 2);
    }
}
