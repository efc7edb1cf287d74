#![cfg(feature = "test-utils")]

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use txn_middleware::test_utils::{ScriptedTransport, Step};
use txn_middleware::{
    Params, RetryPolicy, Transaction, TxConfig, TxState, TxnMiddlewareError, run_retryable_with,
};

#[tokio::test]
async fn cancelling_an_inflight_query_rolls_back() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();
    let token = CancellationToken::new();

    let mut tx = conn
        .begin(TxConfig::new().with_cancellation(token.clone()))
        .await?;
    transport.hang_next(Step::Run);

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        })
    };
    let err = tx.execute("RETURN 1", Params::new()).await.unwrap_err();
    canceller.await.map_err(|e| TxnMiddlewareError::ConnectionError(e.to_string()))?;

    assert_eq!(err, TxnMiddlewareError::Cancelled);
    assert_eq!(tx.state(), &TxState::RolledBack);
    assert_eq!(transport.calls().rollback, 1);
    assert_eq!(transport.open_sessions(), 0);
    assert_eq!(conn.metrics().live_transactions, 0);

    // the slot is free again
    let mut next = conn.begin(TxConfig::default()).await?;
    next.commit().await?;
    Ok(())
}

#[tokio::test]
async fn cancelled_token_stops_begin() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();
    let token = CancellationToken::new();
    token.cancel();

    let err = conn
        .begin(TxConfig::new().with_cancellation(token))
        .await
        .unwrap_err();
    assert_eq!(err, TxnMiddlewareError::Cancelled);
    assert_eq!(conn.metrics().transactions_begun, 0);
    Ok(())
}

#[tokio::test]
async fn cancellation_is_not_retried() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();
    let token = CancellationToken::new();

    let err = run_retryable_with(
        &conn,
        TxConfig::new().with_cancellation(token.clone()),
        RetryPolicy::immediate(5),
        async |tx: &mut Transaction| {
            token.cancel();
            tx.execute("RETURN 1", Params::new()).await?;
            Ok(())
        },
    )
    .await
    .unwrap_err();

    assert_eq!(err, TxnMiddlewareError::Cancelled);
    assert_eq!(transport.calls().open, 1);
    assert_eq!(transport.calls().run, 0);
    assert_eq!(conn.metrics().live_controllers(), 0);
    Ok(())
}
