use thiserror::Error;

use crate::connection::CLIENT_TIMEOUT_CODE;

/// Classification of a [`TxnMiddlewareError`], used by retry decisions and callers that only care
/// about the category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The link to the server is unreachable, refused or already closed.
    Connection,
    /// Deadlock, leader change, timeout and similar failures that may succeed when retried.
    TransientServer,
    /// Malformed query, constraint violation or any other permanent server-side failure.
    Query,
    /// A handle was used in a state that does not allow the operation.
    InvalidState,
    /// A commit found result streams that were neither drained nor discarded.
    StreamNotExhausted,
    /// The operation was cancelled before it completed.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxnMiddlewareError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Transient server error {code}: {message}")]
    TransientServerError { code: String, message: String },

    #[error("Query error {code}: {message}")]
    QueryError { code: String, message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Result stream not exhausted: {0}")]
    StreamNotExhausted(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl TxnMiddlewareError {
    /// Build an error from a server status code such as `Neo.TransientError.Transaction.DeadlockDetected`.
    ///
    /// Transient codes become [`TxnMiddlewareError::TransientServerError`], everything else is a
    /// [`TxnMiddlewareError::QueryError`]. A handful of codes are reclassified: the server uses
    /// the transient namespace for a terminated transaction (retrying cannot help), and the client
    /// namespace for a leader switch or an expired authorization (retrying on a fresh transaction
    /// does help).
    #[must_use]
    pub fn from_server(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if is_transient_code(&code) {
            Self::TransientServerError { code, message }
        } else {
            Self::QueryError { code, message }
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionError(_) => ErrorKind::Connection,
            Self::TransientServerError { .. } => ErrorKind::TransientServer,
            Self::QueryError { .. } => ErrorKind::Query,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::StreamNotExhausted(_) => ErrorKind::StreamNotExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientServer
    }

    /// Server status code, if the error came from the server.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::TransientServerError { code, .. } | Self::QueryError { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether a commit that failed with this error may still have been applied by the server.
    ///
    /// True for a lost connection and for a client-side request timeout; a status reported by the
    /// server means the commit was not applied.
    #[must_use]
    pub fn leaves_commit_unknown(&self) -> bool {
        match self {
            Self::ConnectionError(_) => true,
            Self::TransientServerError { code, .. } => code == CLIENT_TIMEOUT_CODE,
            _ => false,
        }
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

const NOT_RETRYABLE_TRANSIENT: [&str; 2] = [
    "Neo.TransientError.Transaction.Terminated",
    "Neo.TransientError.Transaction.LockClientStopped",
];

const RETRYABLE_CLIENT: [&str; 2] = [
    "Neo.ClientError.Cluster.NotALeader",
    "Neo.ClientError.Security.AuthorizationExpired",
];

fn is_transient_code(code: &str) -> bool {
    if RETRYABLE_CLIENT.contains(&code) {
        return true;
    }
    code.starts_with("Neo.TransientError.") && !NOT_RETRYABLE_TRANSIENT.contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_server_codes() {
        let deadlock = TxnMiddlewareError::from_server(
            "Neo.TransientError.Transaction.DeadlockDetected",
            "deadlock",
        );
        assert!(deadlock.is_transient());

        let terminated =
            TxnMiddlewareError::from_server("Neo.TransientError.Transaction.Terminated", "bye");
        assert_eq!(terminated.kind(), ErrorKind::Query);

        let leader = TxnMiddlewareError::from_server("Neo.ClientError.Cluster.NotALeader", "moved");
        assert!(leader.is_transient());

        let syntax = TxnMiddlewareError::from_server("Neo.ClientError.Statement.SyntaxError", "?");
        assert_eq!(syntax.kind(), ErrorKind::Query);
        assert_eq!(syntax.code(), Some("Neo.ClientError.Statement.SyntaxError"));
    }

    #[test]
    fn unknown_commit_outcomes() {
        assert!(TxnMiddlewareError::ConnectionError("reset".into()).leaves_commit_unknown());
        let timeout = TxnMiddlewareError::from_server(CLIENT_TIMEOUT_CODE, "slow");
        assert!(timeout.leaves_commit_unknown());

        let deadlock = TxnMiddlewareError::from_server(
            "Neo.TransientError.Transaction.DeadlockDetected",
            "deadlock",
        );
        assert!(!deadlock.leaves_commit_unknown());
        assert!(!TxnMiddlewareError::Cancelled.leaves_commit_unknown());
    }
}
