use crate::error::TxnMiddlewareError;

/// Terminal outcome of one attempt, reported by a bound transaction to its retry controller.
///
/// A transaction reports exactly once: on its first recorded failure, on a successful commit,
/// on a rollback that was not preceded by a failure, or when it is dropped while still open.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The commit succeeded.
    Committed,
    /// The first error recorded by the attempt (including a failed begin).
    Failed(TxnMiddlewareError),
    /// The commit request failed without a server verdict; the commit may have been applied.
    CommitUnknown(TxnMiddlewareError),
    /// The caller rolled back without any recorded failure.
    RolledBack,
    /// The transaction was dropped without being finalized.
    Abandoned,
}

impl AttemptOutcome {
    /// Borrow the failure, if the attempt failed.
    #[must_use]
    pub fn error(&self) -> Option<&TxnMiddlewareError> {
        match self {
            Self::Failed(err) | Self::CommitUnknown(err) => Some(err),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}
