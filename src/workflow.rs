//! Retry loop around a unit of work.
//!
//! ```rust,no_run
//! use txn_middleware::prelude::*;
//!
//! # async fn demo(conn: &Connection) -> Result<(), TxnMiddlewareError> {
//! let x = run_retryable(conn, TxConfig::default(), async |tx: &mut Transaction| {
//!     let mut stream = tx
//!         .execute("RETURN $p AS x", Params::new().with("p", 777))
//!         .await?;
//!     let mut x = None;
//!     while stream.advance().await? {
//!         x = stream.read_column(0)?.as_int();
//!     }
//!     Ok(x)
//! })
//! .await?;
//! assert_eq!(x, Some(777));
//! # Ok(())
//! # }
//! ```

use crate::connection::Connection;
use crate::error::TxnMiddlewareError;
use crate::retry::RetryPolicy;
use crate::transaction::{Transaction, TxConfig};

/// Run `work` in a transaction and commit, retrying transient failures with the connection's
/// retry policy.
///
/// # Errors
/// Returns the error of the last attempt when it failed permanently, the attempt budget or the
/// retry deadline ran out, the work itself returned an error that the transaction did not
/// record, or the commit request was lost and may have been applied.
pub async fn run_retryable<T, F>(
    conn: &Connection,
    config: TxConfig,
    work: F,
) -> Result<T, TxnMiddlewareError>
where
    F: AsyncFnMut(&mut Transaction) -> Result<T, TxnMiddlewareError>,
{
    let policy = conn.config().retry.clone();
    run_retryable_with(conn, config, policy, work).await
}

/// [`run_retryable`] with an explicit policy.
///
/// The controller is bound from the first attempt and lives across attempts. Every attempt ends
/// with its transaction finalized (committed or rolled back) before the next one begins.
///
/// # Errors
/// See [`run_retryable`].
pub async fn run_retryable_with<T, F>(
    conn: &Connection,
    config: TxConfig,
    policy: RetryPolicy,
    mut work: F,
) -> Result<T, TxnMiddlewareError>
where
    F: AsyncFnMut(&mut Transaction) -> Result<T, TxnMiddlewareError>,
{
    let mut controller = conn.retry_controller_with(policy);
    loop {
        let err = match Transaction::begin(conn, config.clone(), Some(&mut controller)).await {
            Ok(mut tx) => match attempt(&mut tx, &mut work).await {
                Ok(value) => {
                    tracing::debug!(attempts = tx.attempt(), "retryable transaction committed");
                    return Ok(value);
                }
                Err(err) => err,
            },
            Err(err) => err,
        };

        let retry = controller.should_retry().unwrap_or_else(|decision_err| {
            tracing::debug!(error = %decision_err, "retry decision unavailable");
            false
        });
        if retry {
            tracing::info!(
                attempt = controller.attempts(),
                error = %err,
                "transient failure; retrying transaction"
            );
            controller.backoff().await;
            continue;
        }

        tracing::warn!(
            attempts = controller.attempts(),
            state = ?controller.state(),
            error = %err,
            "giving up on transaction"
        );
        controller.release();
        return Err(err);
    }
}

/// Run `work` in a single unbound transaction: commit on success, roll back on failure.
///
/// # Errors
/// Returns the error of the work, the commit, or the begin.
pub async fn run_once<T, F>(
    conn: &Connection,
    config: TxConfig,
    mut work: F,
) -> Result<T, TxnMiddlewareError>
where
    F: AsyncFnMut(&mut Transaction) -> Result<T, TxnMiddlewareError>,
{
    let mut tx = Transaction::begin(conn, config, None).await?;
    attempt(&mut tx, &mut work).await
}

/// One attempt: run the work, commit, and make sure the transaction is finalized on failure.
async fn attempt<T, F>(tx: &mut Transaction, work: &mut F) -> Result<T, TxnMiddlewareError>
where
    F: AsyncFnMut(&mut Transaction) -> Result<T, TxnMiddlewareError>,
{
    let result = match work(tx).await {
        Ok(value) => tx.commit().await.map(|_| value),
        Err(err) => Err(err),
    };
    if result.is_err() && tx.is_open() {
        if let Err(rollback_err) = tx.rollback().await {
            tracing::debug!(error = %rollback_err, "rollback after failed attempt also failed");
        }
    }
    result
}
