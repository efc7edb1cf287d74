use std::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use txn_middleware::test_utils::ScriptedTransport;
use txn_middleware::{
    Connection, DriverConfig, Params, RetryPolicy, Transaction, Transport, TxConfig,
    TxnMiddlewareError, run_retryable_with,
};

use crate::args::SimConfig;
use crate::backend::FaultyTransport;
use crate::logging::EventLog;
use crate::model::{Totals, UnitPlan, UnitRecord};
use crate::oracle::Oracle;

pub(crate) fn run(config: SimConfig, rng: &mut ChaCha8Rng) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("failed to start runtime: {err}");
            std::process::exit(1);
        }
    };
    if let Err(reason) = runtime.block_on(simulate(&config, rng)) {
        tracing::error!("{reason}");
        std::process::exit(1);
    }
}

async fn simulate(config: &SimConfig, rng: &mut ChaCha8Rng) -> Result<(), String> {
    let transport = Arc::new(FaultyTransport::new(ScriptedTransport::new(), config.clone()));
    let conn = Connection::from_transport(
        DriverConfig::new("bolt://simulator"),
        Arc::clone(&transport) as Arc<dyn Transport>,
    )
    .map_err(|e| format!("failed to build connection: {e}"))?;
    let policy = RetryPolicy::immediate(config.max_attempts);

    let mut events = EventLog::new(config.first_steps, config.tail_steps);
    let mut totals = Totals::default();
    let max_steps = config.iterations.unwrap_or(u64::MAX);
    let max_time = config.duration_ms.unwrap_or(u64::MAX);
    let started = Instant::now();

    let mut step: u64 = 0;
    while step < max_steps && elapsed_ms(started) <= max_time {
        let plan = next_plan(config, rng);
        let unit = run_unit(&conn, &transport, &policy, plan).await;

        let result_label = match unit.result {
            Ok(total) => format!("Ok({total})"),
            Err(kind) => format!("Err({kind:?})"),
        };
        events.record(format!(
            "step={step} plan={:?} attempts={} result={result_label}",
            unit.plan.values, unit.attempts
        ));

        if let Err(reason) = Oracle::check(&unit, config.max_attempts) {
            events.dump_failure(&reason);
            return Err(format!("simulation failed at step {step} (seed {})", config.seed));
        }
        totals.record(&unit);
        step += 1;
    }

    conn.destroy().await;
    let totals_json = serde_json::to_string(&totals).unwrap_or_else(|_| "{}".to_string());
    let faults_json =
        serde_json::to_string(&transport.stats()).unwrap_or_else(|_| "{}".to_string());
    tracing::info!(
        "complete: steps={} time={}ms totals={} faults={}",
        step,
        elapsed_ms(started),
        totals_json,
        faults_json
    );
    Ok(())
}

async fn run_unit(
    conn: &Connection,
    transport: &FaultyTransport,
    policy: &RetryPolicy,
    plan: UnitPlan,
) -> UnitRecord {
    let before = conn.metrics();
    let opens_before = transport.stats().opens;
    let work_calls = Cell::new(0_u64);

    let result = run_retryable_with(
        conn,
        TxConfig::default(),
        policy.clone(),
        async |tx: &mut Transaction| {
            work_calls.set(work_calls.get() + 1);
            read_back(tx, &plan.values).await
        },
    )
    .await;

    UnitRecord {
        result: result.map_err(|e| e.kind()),
        attempts: transport.stats().opens - opens_before,
        work_calls: work_calls.get(),
        before,
        after: conn.metrics(),
        open_sessions: transport.server().open_sessions(),
        plan,
    }
}

async fn read_back(tx: &mut Transaction, values: &[i64]) -> Result<i64, TxnMiddlewareError> {
    let mut total = 0;
    for value in values {
        let mut stream = tx
            .execute("RETURN $v AS v", Params::new().with("v", *value))
            .await?;
        while stream.advance().await? {
            total += stream.read_column(0)?.as_int().unwrap_or_default();
        }
    }
    Ok(total)
}

fn next_plan(config: &SimConfig, rng: &mut ChaCha8Rng) -> UnitPlan {
    let len = rng.random_range(1..=config.queries_per_tx);
    UnitPlan {
        values: (0..len).map(|_| rng.random_range(-1_000..=1_000)).collect(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
