//! Criterion measurement of orchestration overhead: a clean single-attempt transaction versus a
//! workflow that absorbs a seeded share of transient failures. The transport is in-memory, so
//! the numbers reflect bookkeeping cost rather than network latency.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::LazyLock;
use tokio::runtime::Runtime;
use txn_middleware::test_utils::{ScriptedTransport, Step};
use txn_middleware::{Params, RetryPolicy, Transaction, TxConfig, TxnMiddlewareError};

static TOKIO_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("create tokio runtime"));

/// Units of work per iteration; override with `BENCH_UNITS`.
fn unit_count() -> usize {
    std::env::var("BENCH_UNITS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(200)
}

async fn echo(tx: &mut Transaction, p: i64) -> Result<i64, TxnMiddlewareError> {
    let mut stream = tx
        .execute("RETURN $p AS x", Params::new().with("p", p))
        .await?;
    let mut x = 0;
    while stream.advance().await? {
        x = stream.read_column(0)?.as_int().unwrap_or_default();
    }
    Ok(x)
}

fn benchmark_clean(c: &mut Criterion) {
    let units = unit_count();
    let mut group = c.benchmark_group("retry_workflow");
    group.throughput(Throughput::Elements(units as u64));

    group.bench_function(BenchmarkId::new("clean", units), |b| {
        b.to_async(&*TOKIO_RUNTIME).iter(|| async move {
            let transport = ScriptedTransport::new();
            let conn = transport.connection();
            for p in 0..units as i64 {
                let x = txn_middleware::run_retryable_with(
                    &conn,
                    TxConfig::default(),
                    RetryPolicy::immediate(3),
                    async |tx: &mut Transaction| echo(tx, p).await,
                )
                .await
                .expect("clean unit of work");
                black_box(x);
            }
        });
    });
    group.finish();
}

fn benchmark_with_faults(c: &mut Criterion) {
    let units = unit_count();
    let mut group = c.benchmark_group("retry_workflow");
    group.throughput(Throughput::Elements(units as u64));

    // Same fault pattern every iteration.
    let mut rng = ChaCha8Rng::seed_from_u64(1_234_567_890);
    let faults: Vec<bool> = (0..units).map(|_| rng.random_bool(0.25)).collect();

    group.bench_function(BenchmarkId::new("transient_25pct", units), |b| {
        let faults = faults.clone();
        b.to_async(&*TOKIO_RUNTIME).iter(|| {
            let faults = faults.clone();
            async move {
                let transport = ScriptedTransport::new();
                let conn = transport.connection();
                for (p, fault) in faults.iter().enumerate() {
                    if *fault {
                        transport.fail_transient(Step::Run, 1);
                    }
                    let x = txn_middleware::run_retryable_with(
                        &conn,
                        TxConfig::default(),
                        RetryPolicy::immediate(3),
                        async |tx: &mut Transaction| echo(tx, p as i64).await,
                    )
                    .await
                    .expect("unit of work with one retry");
                    black_box(x);
                }
            }
        });
    });
    group.finish();
}

criterion_group!(benches, benchmark_clean, benchmark_with_faults);
criterion_main!(benches);
