use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::{Address, DriverConfig};
use crate::error::TxnMiddlewareError;
use crate::retry::{RetryController, RetryPolicy};
use crate::transaction::{Transaction, TxConfig};
use crate::transport::{Connector, Transport};

/// Status code used when a request exceeds `DriverConfig::request_timeout`.
pub const CLIENT_TIMEOUT_CODE: &str = "Neo.TransientError.Client.RequestTimeout";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One logical link to a database instance.
///
/// Transactions begun on a connection keep its shared state alive, but stop working once the
/// connection is destroyed: every further operation on them fails with `InvalidState`.
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

pub(crate) struct ConnectionShared {
    pub(crate) id: u64,
    pub(crate) config: DriverConfig,
    address: Address,
    pub(crate) transport: Arc<dyn Transport>,
    open: AtomicBool,
    tx_live: AtomicBool,
    pub(crate) counters: Arc<Counters>,
}

/// Snapshot of a connection's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
    pub transactions_begun: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub live_transactions: u64,
    pub controllers_created: u64,
    pub controllers_released: u64,
}

impl ConnectionMetrics {
    /// Controllers created through this connection and not yet released.
    #[must_use]
    pub fn live_controllers(&self) -> u64 {
        self.controllers_created
            .saturating_sub(self.controllers_released)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    live: AtomicU64,
    controllers_created: AtomicU64,
    controllers_released: AtomicU64,
}

impl Counters {
    pub(crate) fn transaction_begun(&self) {
        self.begun.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transaction_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transaction_rolled_back(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transaction_ended(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn controller_created(&self) {
        self.controllers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn controller_released(&self) {
        self.controllers_released.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            transactions_begun: self.begun.load(Ordering::Relaxed),
            transactions_committed: self.committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.rolled_back.load(Ordering::Relaxed),
            live_transactions: self.live.load(Ordering::Relaxed),
            controllers_created: self.controllers_created.load(Ordering::Relaxed),
            controllers_released: self.controllers_released.load(Ordering::Relaxed),
        }
    }
}

impl Connection {
    /// Validate the configuration and establish the link through `connector`.
    ///
    /// # Errors
    /// Returns `TxnMiddlewareError::ConnectionError` if the configuration is invalid, the target
    /// refuses the link, or connecting exceeds `connect_timeout`.
    pub async fn create(
        config: DriverConfig,
        connector: &dyn Connector,
    ) -> Result<Self, TxnMiddlewareError> {
        let address = config.address()?;
        let transport = tokio::time::timeout(config.connect_timeout, connector.connect(&config))
            .await
            .map_err(|_| {
                TxnMiddlewareError::ConnectionError(format!(
                    "connecting to {address} timed out after {:?}",
                    config.connect_timeout
                ))
            })??;
        Ok(Self::wrap(config, address, transport))
    }

    /// Wrap a transport that is already connected.
    ///
    /// # Errors
    /// Returns `TxnMiddlewareError::ConnectionError` if the configuration is invalid.
    pub fn from_transport(
        config: DriverConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, TxnMiddlewareError> {
        let address = config.address()?;
        Ok(Self::wrap(config, address, transport))
    }

    fn wrap(config: DriverConfig, address: Address, transport: Arc<dyn Transport>) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection = id, %address, "connection established");
        Self {
            shared: Arc::new(ConnectionShared {
                id,
                config,
                address,
                transport,
                open: AtomicBool::new(true),
                tx_live: AtomicBool::new(false),
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    /// Close the link. Transactions that are still open become unusable.
    pub async fn destroy(self) {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            self.shared.transport.close().await;
            tracing::info!(connection = self.shared.id, "connection destroyed");
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn metrics(&self) -> ConnectionMetrics {
        self.shared.counters.snapshot()
    }

    /// Begin a transaction that is not bound to any retry controller.
    ///
    /// # Errors
    /// See [`Transaction::begin`].
    pub async fn begin(&self, config: TxConfig) -> Result<Transaction, TxnMiddlewareError> {
        Transaction::begin(self, config, None).await
    }

    /// Begin a transaction whose outcome feeds `controller`.
    ///
    /// # Errors
    /// See [`Transaction::begin`].
    pub async fn begin_bound(
        &self,
        config: TxConfig,
        controller: &mut RetryController,
    ) -> Result<Transaction, TxnMiddlewareError> {
        Transaction::begin(self, config, Some(controller)).await
    }

    /// Controller using the connection's configured retry policy.
    #[must_use]
    pub fn retry_controller(&self) -> RetryController {
        self.retry_controller_with(self.shared.config.retry.clone())
    }

    #[must_use]
    pub fn retry_controller_with(&self, policy: RetryPolicy) -> RetryController {
        RetryController::with_counters(policy, Some(Arc::clone(&self.shared.counters)))
    }

    pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("open", &self.shared.is_open())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            tracing::debug!(connection = self.shared.id, "connection dropped without destroy");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let transport = Arc::clone(&self.shared.transport);
                handle.spawn(async move {
                    transport.close().await;
                });
            }
        }
    }
}

impl ConnectionShared {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), TxnMiddlewareError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TxnMiddlewareError::invalid_state(
                "connection has been destroyed",
            ))
        }
    }

    /// Reserve the single transaction slot of this connection.
    pub(crate) fn claim_slot(&self) -> Result<(), TxnMiddlewareError> {
        self.tx_live
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                TxnMiddlewareError::invalid_state(
                    "connection already has a live transaction",
                )
            })
    }

    pub(crate) fn free_slot(&self) {
        self.tx_live.store(false, Ordering::Release);
    }

    /// Await a transport request, bounded by `request_timeout` when configured.
    pub(crate) async fn request<T, F>(&self, fut: F) -> Result<T, TxnMiddlewareError>
    where
        F: Future<Output = Result<T, TxnMiddlewareError>>,
    {
        match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                Err(TxnMiddlewareError::from_server(
                    CLIENT_TIMEOUT_CODE,
                    format!("request exceeded {limit:?}"),
                ))
            }),
            None => fut.await,
        }
    }
}
