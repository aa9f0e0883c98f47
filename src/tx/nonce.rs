//! Nonce coordination across processes
//!
//! Handles:
//! - Exclusive (wallet, chain) sessions over the store's distributed lock
//! - Stale lock takeover after a crashed holder
//! - Gap-free nonce allocation within a session
//! - Reconciliation of previously pending transactions against the chain

use crate::chain::ChainRpc;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state::{HeldLock, NonceStore, PendingTransaction, TxStatus, WalletKey};

use chrono::{DateTime, Utc};
use ethers::types::{Address, BlockNumber, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// Age after which a held lock is considered abandoned; must outlast the
    /// longest normal session, inclusion wait included
    pub lock_timeout_ms: u64,
    pub lock_retry_delay_ms: u64,
    pub max_lock_retries: u32,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 600_000,
            lock_retry_delay_ms: 100,
            max_lock_retries: 50,
        }
    }
}

/// Exclusive right to allocate nonces for one (wallet, chain)
///
/// Not `Clone`: the session owns the held lock, and ending it consumes both.
pub struct NonceSession {
    key: WalletKey,
    execution_id: String,
    current_nonce: u64,
    started_at: DateTime<Utc>,
    lock: Option<Box<dyn HeldLock>>,
}

impl NonceSession {
    pub fn wallet_address(&self) -> &str {
        &self.key.wallet_address
    }

    pub fn address(&self) -> Address {
        self.key.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.key.chain_id
    }

    pub fn key(&self) -> &WalletKey {
        &self.key
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Next nonce that will be handed out
    pub fn current_nonce(&self) -> u64 {
        self.current_nonce
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl fmt::Debug for NonceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceSession")
            .field("key", &self.key)
            .field("execution_id", &self.execution_id)
            .field("current_nonce", &self.current_nonce)
            .field("started_at", &self.started_at)
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

/// Outcome of reconciling pending rows at session start
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub chain_nonce: u64,
    /// Pending rows found confirmed on chain
    pub reconciled_count: u64,
    pub warnings: Vec<String>,
}

/// Serializes nonce use per (wallet, chain) through a `NonceStore`
pub struct NonceCoordinator {
    store: Arc<dyn NonceStore>,
    config: NonceConfig,
}

impl NonceCoordinator {
    pub fn new(store: Arc<dyn NonceStore>, config: NonceConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn NonceStore> {
        &self.store
    }

    pub fn config(&self) -> &NonceConfig {
        &self.config
    }

    /// Lock the key, fix the nonce baseline and reconcile pending rows
    pub async fn start_session(
        &self,
        wallet_address: &str,
        chain_id: u64,
        execution_id: &str,
        provider: &dyn ChainRpc,
    ) -> CoordinatorResult<(NonceSession, ValidationReport)> {
        let key = WalletKey::new(wallet_address, chain_id)?;
        let lock = self.acquire_lock(&key, execution_id).await?;

        let mut session = NonceSession {
            key,
            execution_id: execution_id.to_string(),
            current_nonce: 0,
            started_at: Utc::now(),
            lock: Some(lock),
        };

        match self.initialize(&mut session, provider).await {
            Ok(report) => {
                crate::metrics::record_session_started(chain_id);
                info!(
                    "Nonce session started for {} by {} at nonce {} ({} reconciled, {} warnings)",
                    session.key,
                    execution_id,
                    session.current_nonce,
                    report.reconciled_count,
                    report.warnings.len()
                );
                Ok((session, report))
            }
            Err(e) => {
                warn!("Nonce session setup failed for {}: {}", session.key, e);
                if let Err(release_err) = self.end_session(session).await {
                    error!("Failed to release nonce lock after setup error: {}", release_err);
                }
                Err(e)
            }
        }
    }

    /// Hand out the session's next nonce
    pub fn get_next_nonce(&self, session: &mut NonceSession) -> u64 {
        let nonce = session.current_nonce;
        session.current_nonce += 1;
        debug!("Allocated nonce {} for {}", nonce, session.key);
        nonce
    }

    /// Track a submission until its outcome is known
    pub async fn record_transaction(
        &self,
        session: &NonceSession,
        nonce: u64,
        tx_hash: H256,
        workflow_id: Option<&str>,
        gas_price: Option<U256>,
    ) -> CoordinatorResult<()> {
        let tx = PendingTransaction {
            wallet_address: session.key.wallet_address.clone(),
            chain_id: session.key.chain_id,
            nonce,
            tx_hash: format!("{:?}", tx_hash),
            execution_id: session.execution_id.clone(),
            workflow_id: workflow_id.map(str::to_string),
            gas_price: gas_price.map(|p| p.to_string()),
            status: TxStatus::Pending,
            submitted_at: Utc::now(),
        };

        self.store.upsert_transaction(&tx).await?;
        debug!("Recorded {} at nonce {} for {}", tx.tx_hash, nonce, session.key);
        Ok(())
    }

    pub async fn confirm_transaction(&self, tx_hash: H256) -> CoordinatorResult<()> {
        let hash = format!("{:?}", tx_hash);
        let updated = self.store.update_status_by_hash(&hash, TxStatus::Confirmed).await?;
        if updated == 0 {
            warn!("Confirmed transaction {} was never recorded", hash);
        }
        Ok(())
    }

    /// Clear the lock row and release the lock
    pub async fn end_session(&self, mut session: NonceSession) -> CoordinatorResult<()> {
        let cleared = self
            .store
            .clear_lock(&session.key, &session.execution_id)
            .await;

        let released = match session.lock.take() {
            Some(lock) => lock.release().await,
            None => Ok(()),
        };

        crate::metrics::record_session_ended(session.key.chain_id);
        info!(
            "Nonce session ended for {} by {} after {}ms",
            session.key,
            session.execution_id,
            (Utc::now() - session.started_at).num_milliseconds()
        );

        cleared.and(released)
    }

    async fn acquire_lock(
        &self,
        key: &WalletKey,
        execution_id: &str,
    ) -> CoordinatorResult<Box<dyn HeldLock>> {
        let timeout = chrono::Duration::milliseconds(self.config.lock_timeout_ms as i64);
        let retry_delay = Duration::from_millis(self.config.lock_retry_delay_ms);
        let mut attempts: u32 = 0;

        loop {
            if let Some(lock) = self.store.try_acquire_lock(key, execution_id).await? {
                crate::metrics::record_lock_acquired(key.chain_id);
                debug!(
                    "Nonce lock for {} acquired by {} after {} retries",
                    key, execution_id, attempts
                );
                return Ok(lock);
            }

            if let Some(existing) = self.store.get_lock(key).await? {
                if existing.is_stale(Utc::now(), timeout) {
                    let holder = existing.locked_by.unwrap_or_default();
                    warn!(
                        "Taking over stale nonce lock for {} from {} (locked at {:?})",
                        key, holder, existing.locked_at
                    );
                    self.store.clear_lock(key, &holder).await?;
                    crate::metrics::record_stale_takeover(key.chain_id);
                    continue;
                }
            }

            attempts += 1;
            crate::metrics::record_lock_contention(key.chain_id);

            if attempts >= self.config.max_lock_retries {
                crate::metrics::record_lock_failure(key.chain_id);
                return Err(CoordinatorError::LockAcquisition {
                    wallet: key.wallet_address.clone(),
                    chain_id: key.chain_id,
                    attempts,
                });
            }

            tokio::time::sleep(retry_delay).await;
        }
    }

    async fn initialize(
        &self,
        session: &mut NonceSession,
        provider: &dyn ChainRpc,
    ) -> CoordinatorResult<ValidationReport> {
        let chain_nonce = provider
            .get_transaction_count(session.address(), BlockNumber::Pending)
            .await?;
        session.current_nonce = chain_nonce;

        self.reconcile(&session.key, chain_nonce, provider).await
    }

    async fn reconcile(
        &self,
        key: &WalletKey,
        chain_nonce: u64,
        provider: &dyn ChainRpc,
    ) -> CoordinatorResult<ValidationReport> {
        let mut report = ValidationReport {
            chain_nonce,
            ..ValidationReport::default()
        };

        for tx in self.store.pending_transactions(key).await? {
            if tx.nonce > chain_nonce {
                continue;
            }

            let hash: H256 = tx.tx_hash.parse().map_err(|e| {
                CoordinatorError::Internal(format!("Stored hash {} is invalid: {}", tx.tx_hash, e))
            })?;

            let outcome = if tx.nonce < chain_nonce {
                if provider.get_transaction_receipt(hash).await?.is_some() {
                    self.store.update_status(key, tx.nonce, TxStatus::Confirmed).await?;
                    report.reconciled_count += 1;
                    "confirmed"
                } else {
                    self.store.update_status(key, tx.nonce, TxStatus::Replaced).await?;
                    report.warnings.push(format!(
                        "Transaction {} at nonce {} was replaced or dropped",
                        tx.tx_hash, tx.nonce
                    ));
                    "replaced"
                }
            } else if provider.get_transaction(hash).await?.is_some() {
                report.warnings.push(format!(
                    "Transaction {} at nonce {} is still pending in mempool",
                    tx.tx_hash, tx.nonce
                ));
                "in_mempool"
            } else {
                self.store.update_status(key, tx.nonce, TxStatus::Dropped).await?;
                report.warnings.push(format!(
                    "Transaction {} at nonce {} was dropped from mempool",
                    tx.tx_hash, tx.nonce
                ));
                "dropped"
            };

            crate::metrics::record_reconciliation(key.chain_id, outcome);
        }

        for warning in &report.warnings {
            warn!("Reconciliation for {}: {}", key, warning);
        }

        Ok(report)
    }
}
