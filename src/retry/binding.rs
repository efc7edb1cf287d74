use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;

use crate::connection::Counters;
use crate::tx_outcome::AttemptOutcome;

/// Shared between a controller and the bindings it hands out, so a successful commit can release
/// the controller without borrowing it.
#[derive(Debug)]
pub(crate) struct ReleaseToken {
    released: AtomicBool,
    counters: Option<Arc<Counters>>,
}

impl ReleaseToken {
    pub(crate) fn new(counters: Option<Arc<Counters>>) -> Self {
        if let Some(counters) = &counters {
            counters.controller_created();
        }
        Self {
            released: AtomicBool::new(false),
            counters,
        }
    }

    /// Returns `true` for the call that actually released.
    pub(crate) fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(counters) = &self.counters {
            counters.controller_released();
        }
        true
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// The transaction side of a binding: reports the attempt's outcome to the controller once.
#[derive(Debug)]
pub(crate) struct RetryBinding {
    sender: Option<oneshot::Sender<AttemptOutcome>>,
    token: Arc<ReleaseToken>,
    attempt: u32,
}

impl RetryBinding {
    pub(crate) fn new(
        sender: oneshot::Sender<AttemptOutcome>,
        token: Arc<ReleaseToken>,
        attempt: u32,
    ) -> Self {
        Self {
            sender: Some(sender),
            token,
            attempt,
        }
    }

    /// 1-based number of the attempt this binding belongs to.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Deliver the outcome; later calls are ignored.
    pub(crate) fn report(&mut self, outcome: AttemptOutcome) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        if outcome.is_committed() && self.token.release() {
            tracing::debug!(attempt = self.attempt, "commit released retry controller");
        }
        // The controller may already be gone; nothing left to inform then.
        let _ = sender.send(outcome);
    }
}

impl Drop for RetryBinding {
    fn drop(&mut self) {
        self.report(AttemptOutcome::Abandoned);
    }
}
