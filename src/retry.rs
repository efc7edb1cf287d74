//! Retry decisions for transactions that fail with transient errors.
//!
//! A [`RetryController`] outlives the individual attempts of one unit of work. Each attempt's
//! transaction is bound to it at begin and reports its terminal outcome through a one-shot
//! channel; the controller only looks at that outcome when asked [`RetryController::should_retry`].

mod binding;
mod policy;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::time::Instant;

use crate::connection::Counters;
use crate::error::TxnMiddlewareError;
use crate::tx_outcome::AttemptOutcome;

pub(crate) use binding::{ReleaseToken, RetryBinding};
pub use policy::RetryPolicy;

/// Where the controller stands after the last finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// No attempt has finished yet.
    Fresh,
    /// The bound transaction reported a failure.
    AttemptFailed,
    /// The bound transaction committed.
    AttemptSucceeded,
    /// The attempt budget or the retry deadline is used up.
    Exhausted,
}

pub struct RetryController {
    policy: RetryPolicy,
    state: RetryState,
    attempts: u32,
    last_error: Option<TxnMiddlewareError>,
    commit_unknown: bool,
    pending: Option<oneshot::Receiver<AttemptOutcome>>,
    started: Option<Instant>,
    token: Arc<ReleaseToken>,
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("bound", &self.pending.is_some())
            .field("released", &self.token.is_released())
            .finish_non_exhaustive()
    }
}

impl RetryController {
    /// Standalone controller. Prefer [`Connection::retry_controller`](crate::Connection::retry_controller),
    /// which also tracks the controller in the connection's metrics.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_counters(policy, None)
    }

    pub(crate) fn with_counters(policy: RetryPolicy, counters: Option<Arc<Counters>>) -> Self {
        Self {
            policy,
            state: RetryState::Fresh,
            attempts: 0,
            last_error: None,
            commit_unknown: false,
            pending: None,
            started: None,
            token: Arc::new(ReleaseToken::new(counters)),
        }
    }

    /// State as of the last [`should_retry`](Self::should_retry) (or bind) call.
    #[must_use]
    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Number of attempts whose outcome has been observed.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Failure reported by the last finished attempt, if it failed with an error.
    #[must_use]
    pub fn last_error(&self) -> Option<&TxnMiddlewareError> {
        self.last_error.as_ref()
    }

    /// Whether the last attempt failed during a commit that the server may have applied.
    #[must_use]
    pub fn commit_outcome_unknown(&self) -> bool {
        self.commit_unknown
    }

    /// Whether the controller has been released, either explicitly or by a successful commit.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.token.is_released()
    }

    /// Hand out the binding for the next attempt.
    pub(crate) fn bind(&mut self) -> Result<RetryBinding, TxnMiddlewareError> {
        if self.token.is_released() {
            return Err(TxnMiddlewareError::invalid_state(
                "retry controller has already been released",
            ));
        }
        self.absorb_outcome();
        if self.pending.is_some() {
            return Err(TxnMiddlewareError::invalid_state(
                "retry controller is already bound to a live transaction",
            ));
        }
        if matches!(self.state, RetryState::Exhausted | RetryState::AttemptSucceeded) {
            return Err(TxnMiddlewareError::invalid_state(format!(
                "retry controller cannot start another attempt from state {:?}",
                self.state
            )));
        }

        let (sender, receiver) = oneshot::channel();
        self.pending = Some(receiver);
        self.started.get_or_insert_with(Instant::now);
        Ok(RetryBinding::new(
            sender,
            Arc::clone(&self.token),
            self.attempts + 1,
        ))
    }

    /// Decide whether another attempt should be made.
    ///
    /// True only if the last attempt failed with a retryable error outside an unknown commit
    /// outcome, the attempt budget is not used up and the retry deadline has not passed. Running out of budget or time moves the controller
    /// to [`RetryState::Exhausted`].
    ///
    /// # Errors
    /// Returns `TxnMiddlewareError::InvalidState` if no bound transaction has finished yet.
    pub fn should_retry(&mut self) -> Result<bool, TxnMiddlewareError> {
        self.absorb_outcome();
        if self.pending.is_some() {
            return Err(TxnMiddlewareError::invalid_state(
                "bound transaction has not finished yet",
            ));
        }

        let retry = match self.state {
            RetryState::Fresh => {
                return Err(TxnMiddlewareError::invalid_state(
                    "no attempt has finished yet",
                ));
            }
            RetryState::AttemptSucceeded | RetryState::Exhausted => false,
            RetryState::AttemptFailed => {
                let retryable = self
                    .last_error
                    .as_ref()
                    .is_some_and(|err| self.policy.is_retryable(err));
                if !retryable || self.commit_unknown {
                    false
                } else if self.attempts >= self.policy.attempt_budget() || self.deadline_passed() {
                    self.state = RetryState::Exhausted;
                    false
                } else {
                    true
                }
            }
        };

        tracing::debug!(
            attempts = self.attempts,
            state = ?self.state,
            retry,
            "retry decision"
        );
        Ok(retry)
    }

    /// Delay to wait before the next attempt.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        self.policy.delay_for(self.attempts, &mut rand::rng())
    }

    /// Sleep for [`next_delay`](Self::next_delay).
    pub async fn backoff(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tracing::debug!(attempts = self.attempts, ?delay, "backing off before retry");
            tokio::time::sleep(delay).await;
        }
    }

    /// Release the controller once the retry loop is over.
    ///
    /// Releasing after a successful commit (which already released the controller) is a no-op,
    /// as is dropping the controller after this call: a controller is counted as released
    /// exactly once.
    pub fn release(self) {
        drop(self);
    }

    fn deadline_passed(&self) -> bool {
        match (self.policy.max_retry_time, self.started) {
            (Some(limit), Some(started)) => started.elapsed() >= limit,
            _ => false,
        }
    }

    fn absorb_outcome(&mut self) {
        let Some(receiver) = self.pending.as_mut() else {
            return;
        };
        let outcome = match receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Closed) => AttemptOutcome::Abandoned,
        };
        self.pending = None;
        self.attempts += 1;
        self.commit_unknown = matches!(outcome, AttemptOutcome::CommitUnknown(_));
        match outcome {
            AttemptOutcome::Committed => {
                self.state = RetryState::AttemptSucceeded;
                self.last_error = None;
            }
            AttemptOutcome::Failed(err) | AttemptOutcome::CommitUnknown(err) => {
                tracing::debug!(
                    attempt = self.attempts,
                    error = %err,
                    commit_unknown = self.commit_unknown,
                    "attempt failed"
                );
                self.state = RetryState::AttemptFailed;
                self.last_error = Some(err);
            }
            AttemptOutcome::RolledBack | AttemptOutcome::Abandoned => {
                self.state = RetryState::AttemptFailed;
                self.last_error = None;
            }
        }
    }
}

impl Drop for RetryController {
    fn drop(&mut self) {
        if self.token.release() {
            tracing::debug!(
                attempts = self.attempts,
                state = ?self.state,
                "retry controller released"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> TxnMiddlewareError {
        TxnMiddlewareError::from_server("Neo.TransientError.General.DatabaseUnavailable", "busy")
    }

    #[test]
    fn should_retry_requires_a_finished_attempt() {
        let mut ctl = RetryController::new(RetryPolicy::immediate(3));
        assert!(matches!(
            ctl.should_retry(),
            Err(TxnMiddlewareError::InvalidState(_))
        ));

        let binding = ctl.bind().unwrap();
        assert!(ctl.should_retry().is_err());
        assert!(ctl.bind().is_err(), "second live binding must be refused");
        drop(binding);
        assert_eq!(ctl.should_retry(), Ok(false));
        assert_eq!(ctl.attempts(), 1);
    }

    #[test]
    fn transient_failures_until_budget_exhausted() {
        let mut ctl = RetryController::new(RetryPolicy::immediate(2));

        let mut binding = ctl.bind().unwrap();
        binding.report(AttemptOutcome::Failed(transient()));
        assert_eq!(ctl.should_retry(), Ok(true));
        assert_eq!(ctl.state(), RetryState::AttemptFailed);

        let mut binding = ctl.bind().unwrap();
        assert_eq!(binding.attempt(), 2);
        binding.report(AttemptOutcome::Failed(transient()));
        assert_eq!(ctl.should_retry(), Ok(false));
        assert_eq!(ctl.state(), RetryState::Exhausted);
        assert!(ctl.bind().is_err());
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let mut ctl = RetryController::new(RetryPolicy::immediate(5));
        let mut binding = ctl.bind().unwrap();
        binding.report(AttemptOutcome::Failed(TxnMiddlewareError::from_server(
            "Neo.ClientError.Schema.ConstraintValidationFailed",
            "dupe",
        )));
        assert_eq!(ctl.should_retry(), Ok(false));
        assert_eq!(ctl.state(), RetryState::AttemptFailed);
    }

    #[test]
    fn unknown_commit_outcome_is_not_retried() {
        let policy = RetryPolicy::immediate(5).with_connection_retries(true);
        let mut ctl = RetryController::new(policy);

        let mut binding = ctl.bind().unwrap();
        binding.report(AttemptOutcome::Failed(TxnMiddlewareError::ConnectionError(
            "reset".into(),
        )));
        assert_eq!(ctl.should_retry(), Ok(true));
        assert!(!ctl.commit_outcome_unknown());

        let mut binding = ctl.bind().unwrap();
        binding.report(AttemptOutcome::CommitUnknown(
            TxnMiddlewareError::ConnectionError("reset during commit".into()),
        ));
        assert_eq!(ctl.should_retry(), Ok(false));
        assert!(ctl.commit_outcome_unknown());
        assert_eq!(ctl.state(), RetryState::AttemptFailed);
        assert_eq!(ctl.attempts(), 2);
    }

    #[test]
    fn commit_releases_controller() {
        let mut ctl = RetryController::new(RetryPolicy::immediate(5));
        let mut binding = ctl.bind().unwrap();
        binding.report(AttemptOutcome::Committed);
        assert!(ctl.is_released());
        assert_eq!(ctl.should_retry(), Ok(false));
        assert_eq!(ctl.state(), RetryState::AttemptSucceeded);
        ctl.release();
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exhausts_controller() {
        let policy = RetryPolicy::immediate(100).with_max_retry_time(Some(Duration::from_secs(5)));
        let mut ctl = RetryController::new(policy);
        let mut binding = ctl.bind().unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        binding.report(AttemptOutcome::Failed(transient()));
        assert_eq!(ctl.should_retry(), Ok(false));
        assert_eq!(ctl.state(), RetryState::Exhausted);
    }
}
