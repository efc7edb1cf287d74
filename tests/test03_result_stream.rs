#![cfg(feature = "test-utils")]

use txn_middleware::test_utils::{ScriptedTransport, Step, transient_error};
use txn_middleware::{Params, TxConfig, TxnMiddlewareError, UnconsumedStreams, Value};

fn people(transport: &ScriptedTransport) {
    transport.with_rows(
        "MATCH (p:Person)",
        &["name", "age"],
        vec![
            vec![Value::from("Ada"), Value::from(36)],
            vec![Value::from("Grace"), Value::from(85)],
            vec![Value::from("Linus"), Value::Null],
        ],
    );
}

#[tokio::test]
async fn advance_is_idempotent_at_end() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    people(&transport);
    let conn = transport.connection();

    let mut tx = conn.begin(TxConfig::default()).await?;
    let mut stream = tx
        .execute("MATCH (p:Person) RETURN p.name AS name, p.age AS age", Params::new())
        .await?;
    let mut names = Vec::new();
    while stream.advance().await? {
        names.push(stream.get("name").and_then(Value::as_str).map(str::to_owned));
    }
    assert_eq!(names.len(), 3);
    assert_eq!(names[1].as_deref(), Some("Grace"));
    assert_eq!(stream.rows_read(), 3);
    assert!(stream.is_exhausted());

    let fetches = transport.calls().fetch;
    assert!(!stream.advance().await?);
    assert!(!stream.advance().await?);
    assert_eq!(transport.calls().fetch, fetches, "no fetch after the end");
    assert_eq!(stream.summary().map(|s| s.records_read), Some(3));
    assert!(matches!(
        stream.read_column(0),
        Err(TxnMiddlewareError::InvalidState(_))
    ));
    drop(stream);
    tx.commit().await?;
    Ok(())
}

#[tokio::test]
async fn read_column_before_advance_and_out_of_range() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();

    let mut tx = conn.begin(TxConfig::default()).await?;
    let mut stream = tx
        .execute("RETURN $a AS a, $b AS b", Params::new().with("a", 1).with("b", "two"))
        .await?;
    assert!(matches!(
        stream.read_column(0),
        Err(TxnMiddlewareError::InvalidState(_))
    ));
    assert!(stream.advance().await?);
    assert_eq!(stream.read_column(0)?, &Value::Integer(1));
    assert_eq!(stream.read_column(1)?.as_str(), Some("two"));
    assert!(matches!(
        stream.read_column(2),
        Err(TxnMiddlewareError::InvalidState(_))
    ));
    let record = stream.current().cloned();
    assert_eq!(record.and_then(|r| r.get("b").cloned()), Some(Value::from("two")));
    let summary = stream.consume().await?;
    assert_eq!(summary.records_read, 1);
    tx.commit().await?;
    Ok(())
}

#[tokio::test]
async fn fetch_failure_is_recorded_and_repeated() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    people(&transport);
    let conn = transport.connection();

    let mut tx = conn.begin(TxConfig::default()).await?;
    {
        let mut stream = tx
            .execute("MATCH (p:Person) RETURN p", Params::new())
            .await?;
        assert!(stream.advance().await?);
        transport.fail_next(Step::Fetch, transient_error());
        assert_eq!(stream.advance().await.unwrap_err(), transient_error());
        let fetches = transport.calls().fetch;
        assert_eq!(stream.advance().await.unwrap_err(), transient_error());
        assert_eq!(transport.calls().fetch, fetches);
    }
    assert_eq!(tx.last_error(), Some(&transient_error()));
    assert_eq!(tx.commit().await.unwrap_err(), transient_error());
    tx.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn commit_discards_unconsumed_streams() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    people(&transport);
    let conn = transport.connection();

    let mut tx = conn.begin(TxConfig::default()).await?;
    {
        let mut stream = tx
            .execute("MATCH (p:Person) RETURN p", Params::new())
            .await?;
        assert!(stream.advance().await?);
    }
    assert_eq!(transport.open_streams(), 1);
    tx.commit().await?;
    assert_eq!(transport.calls().discard, 1);
    assert_eq!(transport.open_streams(), 0);
    Ok(())
}

#[tokio::test]
async fn commit_rejects_unconsumed_streams_when_asked() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    people(&transport);
    let conn = transport.connection();

    let config = TxConfig::new().with_unconsumed(UnconsumedStreams::Reject);
    let mut tx = conn.begin(config).await?;
    let _ = tx.execute("MATCH (p:Person) RETURN p", Params::new()).await?;
    assert!(matches!(
        tx.commit().await,
        Err(TxnMiddlewareError::StreamNotExhausted(_))
    ));
    assert_eq!(transport.calls().commit, 0);
    tx.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn explicit_discard_skips_remaining_records() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    people(&transport);
    let conn = transport.connection();

    let config = TxConfig::new().with_unconsumed(UnconsumedStreams::Reject);
    let mut tx = conn.begin(config).await?;
    let mut stream = tx
        .execute("MATCH (p:Person) RETURN p", Params::new())
        .await?;
    assert!(stream.advance().await?);
    let summary = stream.discard().await?;
    assert_eq!(summary.records_read, 1);
    assert_eq!(summary.query_type.as_deref(), Some("r"));
    tx.commit().await?;
    Ok(())
}

#[tokio::test]
async fn next_record_yields_owned_records() -> Result<(), TxnMiddlewareError> {
    let transport = ScriptedTransport::new();
    people(&transport);
    let conn = transport.connection();

    let mut tx = conn.begin(TxConfig::default()).await?;
    let mut records = Vec::new();
    {
        let mut stream = tx
            .execute("MATCH (p:Person) RETURN p", Params::new())
            .await?;
        while let Some(record) = stream.next_record().await? {
            records.push(record);
        }
    }
    tx.commit().await?;

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].get("age").and_then(Value::as_int), Some(36));
    assert!(records[2].get("age").is_some_and(Value::is_null));
    assert_eq!(records[2].key_position("age"), Some(1));
    Ok(())
}
