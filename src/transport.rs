//! Boundary to the wire protocol.
//!
//! The orchestration layer never speaks to a server directly; it drives an implementation of
//! [`Transport`] obtained from a [`Connector`]. Implementations translate these calls to their
//! protocol and map server failures through [`TxnMiddlewareError::from_server`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DriverConfig;
use crate::error::TxnMiddlewareError;
use crate::results::{CommitSummary, QuerySummary};
use crate::transaction::TxConfig;
use crate::types::{Params, Value};

/// Server-side identity of an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(pub u64);

/// Server-side identity of an open result stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

/// Reply to `run_query`: the stream to pull from and its column keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHandle {
    pub stream: StreamHandle,
    pub keys: Vec<String>,
}

/// One step of a result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Record(Vec<Value>),
    End(QuerySummary),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a transaction with the given configuration.
    async fn open_transaction(&self, config: &TxConfig) -> Result<SessionToken, TxnMiddlewareError>;

    /// Send a parameterized query inside an open transaction.
    async fn run_query(
        &self,
        session: SessionToken,
        query: &str,
        params: &Params,
    ) -> Result<QueryHandle, TxnMiddlewareError>;

    /// Pull the next record of a stream, or its summary once exhausted.
    async fn fetch_next(&self, stream: StreamHandle) -> Result<Fetched, TxnMiddlewareError>;

    /// Drop the remaining records of a stream without transferring them.
    async fn discard(&self, stream: StreamHandle) -> Result<QuerySummary, TxnMiddlewareError>;

    async fn commit(&self, session: SessionToken) -> Result<CommitSummary, TxnMiddlewareError>;

    async fn rollback(&self, session: SessionToken) -> Result<(), TxnMiddlewareError>;

    /// Release the link. Called once, when the owning connection is destroyed.
    async fn close(&self) {}
}

/// Establishes transports for [`Connection::create`](crate::Connection::create).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &DriverConfig) -> Result<Arc<dyn Transport>, TxnMiddlewareError>;
}
