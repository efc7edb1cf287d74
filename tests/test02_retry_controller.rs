#![cfg(feature = "test-utils")]

use txn_middleware::test_utils::{ScriptedTransport, Step, query_error, transient_error};
use txn_middleware::{
    Connection, Params, RetryController, RetryPolicy, RetryState, Transaction, TxConfig,
    TxnMiddlewareError,
};

async fn attempt_once(
    conn: &Connection,
    controller: &mut RetryController,
) -> Result<i64, TxnMiddlewareError> {
    let mut tx = conn.begin_bound(TxConfig::default(), controller).await?;
    let outcome = read_and_commit(&mut tx).await;
    if outcome.is_err() && tx.is_open() {
        let _ = tx.rollback().await;
    }
    outcome
}

async fn read_and_commit(tx: &mut Transaction) -> Result<i64, TxnMiddlewareError> {
    let mut x = 0;
    let mut stream = tx
        .execute("RETURN $p AS x", Params::new().with("p", 5))
        .await?;
    while stream.advance().await? {
        x = stream.read_column(0)?.as_int().unwrap_or_default();
    }
    drop(stream);
    tx.commit().await?;
    Ok(x)
}

/// Manual retry loop: begin bound, run one query, commit; roll back and ask the controller on
/// failure.
async fn manual_loop(
    conn: &Connection,
    mut controller: RetryController,
) -> Result<(i64, u32), TxnMiddlewareError> {
    loop {
        match attempt_once(conn, &mut controller).await {
            Ok(x) => {
                let attempts = controller.attempts();
                controller.release();
                return Ok((x, attempts));
            }
            Err(err) => {
                if controller.should_retry()? {
                    controller.backoff().await;
                    continue;
                }
                controller.release();
                return Err(err);
            }
        }
    }
}

#[tokio::test]
async fn transient_failures_below_budget_end_in_success() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();
    transport.fail_transient(Step::Run, 2);

    let controller = conn.retry_controller_with(RetryPolicy::immediate(4));
    let (x, attempts) = manual_loop(&conn, controller).await?;
    assert_eq!(x, 5);
    assert_eq!(attempts, 3);

    let metrics = conn.metrics();
    assert_eq!(metrics.controllers_created, 1);
    assert_eq!(metrics.controllers_released, 1, "released exactly once");
    assert_eq!(metrics.transactions_committed, 1);
    assert_eq!(metrics.transactions_rolled_back, 2);
    assert_eq!(transport.open_sessions(), 0);
    Ok(())
}

#[tokio::test]
async fn permanent_error_is_attempted_once() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();
    transport.fail_next(Step::Run, query_error());

    let controller = conn.retry_controller_with(RetryPolicy::immediate(5));
    let err = manual_loop(&conn, controller).await.unwrap_err();
    assert_eq!(err, query_error());
    assert_eq!(transport.calls().open, 1);
    assert_eq!(conn.metrics().live_controllers(), 0);
    Ok(())
}

#[tokio::test]
async fn exhaustion_after_exactly_max_attempts() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();
    transport.fail_transient(Step::Commit, 10);

    let mut controller = conn.retry_controller_with(RetryPolicy::immediate(3));
    let mut began = 0;
    loop {
        let mut tx = conn.begin_bound(TxConfig::default(), &mut controller).await?;
        began += 1;
        if tx.commit().await.is_err() {
            tx.rollback().await?;
        }
        if !controller.should_retry()? {
            break;
        }
    }

    assert_eq!(began, 3);
    assert_eq!(controller.state(), RetryState::Exhausted);
    assert!(controller.last_error().is_some_and(TxnMiddlewareError::is_transient));
    assert!(matches!(
        conn.begin_bound(TxConfig::default(), &mut controller).await,
        Err(TxnMiddlewareError::InvalidState(_))
    ));
    controller.release();
    assert_eq!(conn.metrics().controllers_released, 1);
    Ok(())
}

#[tokio::test]
async fn release_after_commit_is_a_no_op() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();

    let mut controller = conn.retry_controller();
    let mut tx = conn.begin_bound(TxConfig::default(), &mut controller).await?;
    tx.commit().await?;
    assert!(controller.is_released());
    assert_eq!(conn.metrics().controllers_released, 1);

    assert_eq!(controller.should_retry(), Ok(false));
    assert_eq!(controller.state(), RetryState::AttemptSucceeded);
    controller.release();
    assert_eq!(conn.metrics().controllers_released, 1);
    assert_eq!(conn.metrics().live_controllers(), 0);
    Ok(())
}

#[tokio::test]
async fn should_retry_before_outcome_is_invalid() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();

    let mut controller = conn.retry_controller();
    assert!(matches!(
        controller.should_retry(),
        Err(TxnMiddlewareError::InvalidState(_))
    ));

    let mut tx = conn.begin_bound(TxConfig::default(), &mut controller).await?;
    assert!(matches!(
        controller.should_retry(),
        Err(TxnMiddlewareError::InvalidState(_))
    ));
    tx.rollback().await?;
    assert_eq!(controller.should_retry(), Ok(false));
    Ok(())
}

#[tokio::test]
async fn failed_begin_counts_as_an_attempt() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();
    transport.fail_next(Step::Open, transient_error());

    let mut controller = conn.retry_controller_with(RetryPolicy::immediate(2));
    let err = conn
        .begin_bound(TxConfig::default(), &mut controller)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(controller.should_retry(), Ok(true));
    assert_eq!(controller.attempts(), 1);

    let mut tx = conn.begin_bound(TxConfig::default(), &mut controller).await?;
    assert_eq!(tx.attempt(), Some(2));
    tx.commit().await?;
    assert_eq!(controller.should_retry(), Ok(false));
    assert_eq!(controller.state(), RetryState::AttemptSucceeded);
    Ok(())
}

#[tokio::test]
async fn dropped_bound_transaction_is_reported_abandoned() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();

    let mut controller = conn.retry_controller_with(RetryPolicy::immediate(3));
    drop(conn.begin_bound(TxConfig::default(), &mut controller).await?);
    assert_eq!(controller.should_retry(), Ok(false));
    assert_eq!(controller.state(), RetryState::AttemptFailed);
    assert_eq!(controller.attempts(), 1);
    assert!(controller.last_error().is_none());
    Ok(())
}
