//! State management for nonce coordination
//!
//! Handles:
//! - Cross-process wallet locks (advisory lock + metadata row)
//! - Pending transaction tracking for reconciliation
//!
//! `StateManager` persists to PostgreSQL; `MemoryStore` keeps the same
//! semantics inside one process.

mod manager;
mod memory;
mod models;

pub use manager::StateManager;
pub use memory::MemoryStore;
pub use models::{PendingTransaction, TxStatus, WalletKey, WalletLock};

use crate::error::CoordinatorResult;

use async_trait::async_trait;

/// A held wallet lock; dropping it without `release` leaves recovery to the
/// stale-lock timeout.
#[async_trait]
pub trait HeldLock: Send + Sync {
    async fn release(self: Box<Self>) -> CoordinatorResult<()>;
}

/// Persistence used by the nonce coordinator
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Try once to take the lock for `key`; `None` when someone else holds it
    async fn try_acquire_lock(
        &self,
        key: &WalletKey,
        execution_id: &str,
    ) -> CoordinatorResult<Option<Box<dyn HeldLock>>>;

    async fn get_lock(&self, key: &WalletKey) -> CoordinatorResult<Option<WalletLock>>;

    /// Clear lock metadata if it is still held by `holder`
    async fn clear_lock(&self, key: &WalletKey, holder: &str) -> CoordinatorResult<()>;

    /// Rows for `key` still in `pending` status, ordered by nonce
    async fn pending_transactions(
        &self,
        key: &WalletKey,
    ) -> CoordinatorResult<Vec<PendingTransaction>>;

    async fn get_transaction(
        &self,
        key: &WalletKey,
        nonce: u64,
    ) -> CoordinatorResult<Option<PendingTransaction>>;

    /// Insert, or overwrite the row with the same (wallet, chain, nonce)
    async fn upsert_transaction(&self, tx: &PendingTransaction) -> CoordinatorResult<()>;

    async fn update_status(
        &self,
        key: &WalletKey,
        nonce: u64,
        status: TxStatus,
    ) -> CoordinatorResult<()>;

    /// Returns the number of rows updated
    async fn update_status_by_hash(&self, tx_hash: &str, status: TxStatus)
        -> CoordinatorResult<u64>;

    async fn health_check(&self) -> CoordinatorResult<()>;
}
