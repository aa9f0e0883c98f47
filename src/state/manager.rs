//! PostgreSQL state manager
//!
//! Wallet locks are session-level advisory locks held on a dedicated
//! connection that is detached from the pool for the lifetime of the lock.
//! If the holder dies, PostgreSQL drops the connection and the advisory lock
//! with it; the `wallet_locks` row records who holds the key and since when.

use super::{HeldLock, NonceStore, PendingTransaction, TxStatus, WalletKey, WalletLock};
use crate::config::DatabaseConfig;
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Connection, Row};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

/// Advisory lock held on a detached connection
struct PgAdvisoryLock {
    conn: Mutex<PgConnection>,
    lock_id: i64,
}

#[async_trait]
impl HeldLock for PgAdvisoryLock {
    async fn release(self: Box<Self>) -> CoordinatorResult<()> {
        let PgAdvisoryLock { conn, lock_id } = *self;
        let mut conn = conn.into_inner();

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .fetch_one(&mut conn)
            .await;

        // Closing the connection releases the lock even if the unlock failed.
        let closed = conn.close().await;

        match unlocked {
            Ok(true) => {}
            Ok(false) => warn!("Advisory lock {} was not held at release", lock_id),
            Err(e) => return Err(e.into()),
        }
        closed.map_err(CoordinatorError::from)
    }
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(CoordinatorError::Database)?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_locks (
                wallet_address VARCHAR(42) NOT NULL,
                chain_id BIGINT NOT NULL,
                locked_by TEXT,
                locked_at TIMESTAMPTZ,
                PRIMARY KEY (wallet_address, chain_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_transactions (
                id BIGSERIAL PRIMARY KEY,
                wallet_address VARCHAR(42) NOT NULL,
                chain_id BIGINT NOT NULL,
                nonce BIGINT NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                execution_id TEXT NOT NULL,
                workflow_id TEXT,
                gas_price TEXT,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (wallet_address, chain_id, nonce)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_tx_hash
            ON pending_transactions (tx_hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_wallet_status
            ON pending_transactions (wallet_address, chain_id, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn row_to_transaction(row: PgRow) -> CoordinatorResult<PendingTransaction> {
        let status: String = row.try_get("status")?;
        Ok(PendingTransaction {
            wallet_address: row.try_get("wallet_address")?,
            chain_id: row.try_get::<i64, _>("chain_id")? as u64,
            nonce: row.try_get::<i64, _>("nonce")? as u64,
            tx_hash: row.try_get("tx_hash")?,
            execution_id: row.try_get("execution_id")?,
            workflow_id: row.try_get("workflow_id")?,
            gas_price: row.try_get("gas_price")?,
            status: status.parse()?,
            submitted_at: row.try_get("submitted_at")?,
        })
    }
}

#[async_trait]
impl NonceStore for StateManager {
    async fn try_acquire_lock(
        &self,
        key: &WalletKey,
        execution_id: &str,
    ) -> CoordinatorResult<Option<Box<dyn HeldLock>>> {
        let lock_id = key.lock_id();
        let mut conn = self.pool.acquire().await?.detach();

        let acquired = match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut conn)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                let _ = conn.close().await;
                return Err(e.into());
            }
        };

        if !acquired {
            conn.close().await?;
            return Ok(None);
        }

        let lock = Box::new(PgAdvisoryLock {
            conn: Mutex::new(conn),
            lock_id,
        });

        let recorded = sqlx::query(
            r#"
            INSERT INTO wallet_locks (wallet_address, chain_id, locked_by, locked_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (wallet_address, chain_id)
            DO UPDATE SET locked_by = EXCLUDED.locked_by, locked_at = EXCLUDED.locked_at
            "#,
        )
        .bind(&key.wallet_address)
        .bind(key.chain_id as i64)
        .bind(execution_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = recorded {
            if let Err(release_err) = lock.release().await {
                warn!("Failed to release lock {} after metadata error: {}", key, release_err);
            }
            return Err(e.into());
        }

        debug!("Advisory lock {} taken for {} by {}", lock_id, key, execution_id);
        Ok(Some(lock))
    }

    async fn get_lock(&self, key: &WalletKey) -> CoordinatorResult<Option<WalletLock>> {
        let row = sqlx::query(
            r#"
            SELECT locked_by, locked_at
            FROM wallet_locks
            WHERE wallet_address = $1 AND chain_id = $2
            "#,
        )
        .bind(&key.wallet_address)
        .bind(key.chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> CoordinatorResult<WalletLock> {
            Ok(WalletLock {
                wallet_address: key.wallet_address.clone(),
                chain_id: key.chain_id,
                locked_by: r.try_get("locked_by")?,
                locked_at: r.try_get::<Option<DateTime<Utc>>, _>("locked_at")?,
            })
        })
        .transpose()
    }

    async fn clear_lock(&self, key: &WalletKey, holder: &str) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            UPDATE wallet_locks
            SET locked_by = NULL, locked_at = NULL
            WHERE wallet_address = $1 AND chain_id = $2 AND locked_by = $3
            "#,
        )
        .bind(&key.wallet_address)
        .bind(key.chain_id as i64)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_transactions(
        &self,
        key: &WalletKey,
    ) -> CoordinatorResult<Vec<PendingTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT wallet_address, chain_id, nonce, tx_hash, execution_id, workflow_id,
                   gas_price, status, submitted_at
            FROM pending_transactions
            WHERE wallet_address = $1 AND chain_id = $2 AND status = 'pending'
            ORDER BY nonce
            "#,
        )
        .bind(&key.wallet_address)
        .bind(key.chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_transaction).collect()
    }

    async fn get_transaction(
        &self,
        key: &WalletKey,
        nonce: u64,
    ) -> CoordinatorResult<Option<PendingTransaction>> {
        let row = sqlx::query(
            r#"
            SELECT wallet_address, chain_id, nonce, tx_hash, execution_id, workflow_id,
                   gas_price, status, submitted_at
            FROM pending_transactions
            WHERE wallet_address = $1 AND chain_id = $2 AND nonce = $3
            "#,
        )
        .bind(&key.wallet_address)
        .bind(key.chain_id as i64)
        .bind(nonce as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_transaction).transpose()
    }

    async fn upsert_transaction(&self, tx: &PendingTransaction) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_transactions
                (wallet_address, chain_id, nonce, tx_hash, execution_id, workflow_id,
                 gas_price, status, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (wallet_address, chain_id, nonce)
            DO UPDATE SET tx_hash = EXCLUDED.tx_hash,
                          execution_id = EXCLUDED.execution_id,
                          workflow_id = EXCLUDED.workflow_id,
                          gas_price = EXCLUDED.gas_price,
                          status = EXCLUDED.status,
                          submitted_at = EXCLUDED.submitted_at
            "#,
        )
        .bind(&tx.wallet_address)
        .bind(tx.chain_id as i64)
        .bind(tx.nonce as i64)
        .bind(&tx.tx_hash)
        .bind(&tx.execution_id)
        .bind(&tx.workflow_id)
        .bind(&tx.gas_price)
        .bind(tx.status.as_str())
        .bind(tx.submitted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_status(
        &self,
        key: &WalletKey,
        nonce: u64,
        status: TxStatus,
    ) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            UPDATE pending_transactions
            SET status = $1
            WHERE wallet_address = $2 AND chain_id = $3 AND nonce = $4
            "#,
        )
        .bind(status.as_str())
        .bind(&key.wallet_address)
        .bind(key.chain_id as i64)
        .bind(nonce as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_status_by_hash(
        &self,
        tx_hash: &str,
        status: TxStatus,
    ) -> CoordinatorResult<u64> {
        // Hashes are stored in their lower-case `{:?}` form.
        let result = sqlx::query(
            r#"
            UPDATE pending_transactions
            SET status = $1
            WHERE tx_hash = $2
            "#,
        )
        .bind(status.as_str())
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
