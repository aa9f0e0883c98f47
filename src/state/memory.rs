//! In-process nonce store
//!
//! Locks are the metadata rows themselves: a key is locked while its row has
//! a holder. Staleness is judged by the coordinator exactly as for PostgreSQL.

use super::{HeldLock, NonceStore, PendingTransaction, TxStatus, WalletKey, WalletLock};
use crate::error::CoordinatorResult;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

type TxKey = (String, u64, u64);

#[derive(Default)]
struct Tables {
    locks: DashMap<WalletKey, WalletLock>,
    transactions: DashMap<TxKey, PendingTransaction>,
}

/// Nonce store backed by process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Tables>,
}

struct MemoryLock {
    tables: Arc<Tables>,
    key: WalletKey,
    execution_id: String,
}

#[async_trait]
impl HeldLock for MemoryLock {
    async fn release(self: Box<Self>) -> CoordinatorResult<()> {
        clear_if_held_by(&self.tables, &self.key, &self.execution_id);
        Ok(())
    }
}

fn clear_if_held_by(tables: &Tables, key: &WalletKey, holder: &str) {
    if let Some(mut lock) = tables.locks.get_mut(key) {
        if lock.locked_by.as_deref() == Some(holder) {
            lock.locked_by = None;
            lock.locked_at = None;
        }
    }
}

fn tx_key(wallet_address: &str, chain_id: u64, nonce: u64) -> TxKey {
    (wallet_address.to_string(), chain_id, nonce)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a lock row directly, as a crashed holder would have left it
    pub fn insert_lock(&self, lock: WalletLock) {
        let key = WalletKey {
            wallet_address: lock.wallet_address.clone(),
            chain_id: lock.chain_id,
        };
        self.tables.locks.insert(key, lock);
    }

    /// All rows for a key, any status, ordered by nonce
    pub fn transactions(&self, key: &WalletKey) -> Vec<PendingTransaction> {
        let mut rows: Vec<_> = self
            .tables
            .transactions
            .iter()
            .filter(|e| e.wallet_address == key.wallet_address && e.chain_id == key.chain_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|tx| tx.nonce);
        rows
    }
}

#[async_trait]
impl NonceStore for MemoryStore {
    async fn try_acquire_lock(
        &self,
        key: &WalletKey,
        execution_id: &str,
    ) -> CoordinatorResult<Option<Box<dyn HeldLock>>> {
        let acquired = match self.tables.locks.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_held() {
                    false
                } else {
                    let lock = entry.get_mut();
                    lock.locked_by = Some(execution_id.to_string());
                    lock.locked_at = Some(Utc::now());
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(WalletLock {
                    wallet_address: key.wallet_address.clone(),
                    chain_id: key.chain_id,
                    locked_by: Some(execution_id.to_string()),
                    locked_at: Some(Utc::now()),
                });
                true
            }
        };

        if !acquired {
            return Ok(None);
        }

        Ok(Some(Box::new(MemoryLock {
            tables: self.tables.clone(),
            key: key.clone(),
            execution_id: execution_id.to_string(),
        })))
    }

    async fn get_lock(&self, key: &WalletKey) -> CoordinatorResult<Option<WalletLock>> {
        Ok(self.tables.locks.get(key).map(|lock| lock.clone()))
    }

    async fn clear_lock(&self, key: &WalletKey, holder: &str) -> CoordinatorResult<()> {
        clear_if_held_by(&self.tables, key, holder);
        Ok(())
    }

    async fn pending_transactions(
        &self,
        key: &WalletKey,
    ) -> CoordinatorResult<Vec<PendingTransaction>> {
        Ok(self
            .transactions(key)
            .into_iter()
            .filter(|tx| tx.status == TxStatus::Pending)
            .collect())
    }

    async fn get_transaction(
        &self,
        key: &WalletKey,
        nonce: u64,
    ) -> CoordinatorResult<Option<PendingTransaction>> {
        Ok(self
            .tables
            .transactions
            .get(&tx_key(&key.wallet_address, key.chain_id, nonce))
            .map(|tx| tx.clone()))
    }

    async fn upsert_transaction(&self, tx: &PendingTransaction) -> CoordinatorResult<()> {
        self.tables
            .transactions
            .insert(tx_key(&tx.wallet_address, tx.chain_id, tx.nonce), tx.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        key: &WalletKey,
        nonce: u64,
        status: TxStatus,
    ) -> CoordinatorResult<()> {
        if let Some(mut tx) = self
            .tables
            .transactions
            .get_mut(&tx_key(&key.wallet_address, key.chain_id, nonce))
        {
            tx.status = status;
        }
        Ok(())
    }

    async fn update_status_by_hash(
        &self,
        tx_hash: &str,
        status: TxStatus,
    ) -> CoordinatorResult<u64> {
        let mut updated = 0;
        for mut tx in self.tables.transactions.iter_mut() {
            if tx.tx_hash.eq_ignore_ascii_case(tx_hash) {
                tx.status = status;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        Ok(())
    }
}
