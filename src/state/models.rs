//! Persisted rows and keys for nonce coordination

use crate::error::{CoordinatorError, CoordinatorResult};

use chrono::{DateTime, Duration, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Serialization key: one nonce sequence per (wallet, chain)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WalletKey {
    /// Lower-case 0x-prefixed address
    pub wallet_address: String,
    pub chain_id: u64,
}

impl WalletKey {
    /// Normalize and validate a wallet address for a chain
    pub fn new(wallet_address: &str, chain_id: u64) -> CoordinatorResult<Self> {
        let normalized = wallet_address.trim().to_lowercase();
        normalized.parse::<Address>().map_err(|e| {
            CoordinatorError::Validation(format!("Invalid wallet address {}: {}", wallet_address, e))
        })?;

        Ok(Self {
            wallet_address: normalized,
            chain_id,
        })
    }

    pub fn address(&self) -> Address {
        // Validated in the constructor
        self.wallet_address.parse().unwrap_or_default()
    }

    /// Deterministic 64-bit id for the store's advisory lock
    pub fn lock_id(&self) -> i64 {
        let digest = Keccak256::digest(format!("{}:{}", self.wallet_address, self.chain_id));
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }
}

impl fmt::Display for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.wallet_address, self.chain_id)
    }
}

/// Lock metadata row; `locked_by` is `None` once cleared
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletLock {
    pub wallet_address: String,
    pub chain_id: u64,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl WalletLock {
    /// A held lock whose timestamp is older than `timeout`
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match (&self.locked_by, self.locked_at) {
            (Some(_), Some(locked_at)) => now - locked_at >= timeout,
            _ => false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.locked_by.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Replaced,
    Dropped,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Replaced => "replaced",
            TxStatus::Dropped => "dropped",
        }
    }
}

impl FromStr for TxStatus {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TxStatus::Pending),
            "confirmed" => Ok(TxStatus::Confirmed),
            "replaced" => Ok(TxStatus::Replaced),
            "dropped" => Ok(TxStatus::Dropped),
            other => Err(CoordinatorError::Internal(format!(
                "Unknown transaction status {}",
                other
            ))),
        }
    }
}

/// Submitted transaction tracked until its outcome is known
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTransaction {
    pub wallet_address: String,
    pub chain_id: u64,
    pub nonce: u64,
    pub tx_hash: String,
    pub execution_id: String,
    pub workflow_id: Option<String>,
    /// Wei, decimal
    pub gas_price: Option<String>,
    pub status: TxStatus,
    pub submitted_at: DateTime<Utc>,
}
