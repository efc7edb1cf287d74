//! Convenient imports for common functionality.
//!
//! ```rust
//! use txn_middleware::prelude::*;
//! ```

pub use crate::config::{AuthToken, DriverConfig};
pub use crate::connection::{Connection, ConnectionMetrics};
pub use crate::error::{ErrorKind, TxnMiddlewareError};
pub use crate::results::{CommitSummary, QuerySummary, Record};
pub use crate::retry::{RetryController, RetryPolicy, RetryState};
pub use crate::stream::ResultStream;
pub use crate::transaction::{AccessMode, Transaction, TxConfig, TxState, UnconsumedStreams};
pub use crate::transport::{Connector, Transport};
pub use crate::types::{Params, Value};
pub use crate::workflow::{run_once, run_retryable, run_retryable_with};
