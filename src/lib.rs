//! Transaction orchestration for graph-database clients.
//!
//! A [`Connection`] wraps a [`Transport`]; [`Transaction`]s begun on it record their first
//! failure and hand out lazy [`ResultStream`]s; a [`RetryController`] decides whether a failed
//! unit of work should run again. [`run_retryable`] ties the three together.

pub mod config;
pub mod connection;
pub mod error;
pub mod prelude;
pub mod results;
pub mod retry;
pub mod stream;
pub mod transaction;
pub mod transport;
pub mod tx_outcome;
pub mod types;
pub mod workflow;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{Address, AuthToken, DEFAULT_PORT, DriverConfig, DriverConfigBuilder};
pub use connection::{CLIENT_TIMEOUT_CODE, Connection, ConnectionMetrics};
pub use error::{ErrorKind, TxnMiddlewareError};
pub use results::{CommitSummary, QuerySummary, Record};
pub use retry::{RetryController, RetryPolicy, RetryState};
pub use stream::ResultStream;
pub use transaction::{AccessMode, Transaction, TxConfig, TxState, UnconsumedStreams};
pub use transport::{Connector, Fetched, QueryHandle, SessionToken, StreamHandle, Transport};
pub use tx_outcome::AttemptOutcome;
pub use types::{Node, Params, Relationship, Value, ValueKind};
pub use workflow::{run_once, run_retryable, run_retryable_with};
