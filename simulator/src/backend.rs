use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use txn_middleware::test_utils::{ScriptedTransport, query_error, transient_error};
use txn_middleware::{
    CommitSummary, Fetched, Params, QueryHandle, QuerySummary, SessionToken, StreamHandle,
    Transport, TxConfig, TxnMiddlewareError,
};

use crate::args::SimConfig;
use crate::model::FaultStats;

/// Which transport step a fault roll is made for. Rollback is never faulted so that every
/// server-side transaction the workflow abandons can still be cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultSite {
    Open,
    Run,
    Fetch,
    Commit,
}

struct Injector {
    rng: ChaCha8Rng,
    stats: FaultStats,
}

/// Transport that injects seeded faults in front of an in-memory server.
pub(crate) struct FaultyTransport {
    inner: Arc<ScriptedTransport>,
    injector: Mutex<Injector>,
    config: SimConfig,
}

impl FaultyTransport {
    pub(crate) fn new(inner: Arc<ScriptedTransport>, config: SimConfig) -> Self {
        Self {
            inner,
            injector: Mutex::new(Injector {
                rng: ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(1)),
                stats: FaultStats::default(),
            }),
            config,
        }
    }

    pub(crate) fn server(&self) -> &ScriptedTransport {
        &self.inner
    }

    pub(crate) fn stats(&self) -> FaultStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, Injector> {
        self.injector.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inject(&self, site: FaultSite) -> Result<(), TxnMiddlewareError> {
        let mut injector = self.lock();
        if site == FaultSite::Open {
            injector.stats.opens += 1;
        }
        let roll: f64 = injector.rng.random();
        let io = self.config.io_rate;
        let transient = io + self.config.transient_rate;
        let query = transient + self.config.query_error_rate;

        if roll < io {
            injector.stats.io += 1;
            return Err(TxnMiddlewareError::ConnectionError(format!(
                "connection reset during {site:?}"
            )));
        }
        if roll < transient {
            injector.stats.transient += 1;
            return Err(transient_error());
        }
        if site == FaultSite::Run && roll < query {
            injector.stats.query += 1;
            return Err(query_error());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FaultyTransport {
    async fn open_transaction(&self, config: &TxConfig) -> Result<SessionToken, TxnMiddlewareError> {
        self.inject(FaultSite::Open)?;
        self.inner.open_transaction(config).await
    }

    async fn run_query(
        &self,
        session: SessionToken,
        query: &str,
        params: &Params,
    ) -> Result<QueryHandle, TxnMiddlewareError> {
        self.inject(FaultSite::Run)?;
        self.inner.run_query(session, query, params).await
    }

    async fn fetch_next(&self, stream: StreamHandle) -> Result<Fetched, TxnMiddlewareError> {
        self.inject(FaultSite::Fetch)?;
        self.inner.fetch_next(stream).await
    }

    async fn discard(&self, stream: StreamHandle) -> Result<QuerySummary, TxnMiddlewareError> {
        self.inner.discard(stream).await
    }

    async fn commit(&self, session: SessionToken) -> Result<CommitSummary, TxnMiddlewareError> {
        self.inject(FaultSite::Commit)?;
        self.inner.commit(session).await
    }

    async fn rollback(&self, session: SessionToken) -> Result<(), TxnMiddlewareError> {
        self.inner.rollback(session).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
