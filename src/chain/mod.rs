//! Chain module - RPC access for transaction coordination
//!
//! This module provides:
//! - The `ChainRpc` provider interface consumed by the nonce and gas layers
//! - An ethers-backed HTTP implementation
//! - Primary/fallback failover with retry, backoff and per-call timeouts
//! - A registry caching one failover manager per endpoint pair

pub mod failover;
pub mod provider;
pub mod registry;

pub use failover::{FailoverConfig, FailoverManager, RpcStateChange, RpcStateSnapshot};
pub use provider::EthersRpc;
pub use registry::ProviderRegistry;

use crate::error::CoordinatorResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, Transaction, TransactionReceipt, H256, U256};

/// Current network fee data as reported by an endpoint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeeData {
    /// Legacy gas price
    pub gas_price: Option<U256>,
    /// EIP-1559 fee cap, absent on legacy chains
    pub max_fee_per_gas: Option<U256>,
    /// EIP-1559 tip, absent on legacy chains
    pub max_priority_fee_per_gas: Option<U256>,
    /// Base fee of the latest block
    pub base_fee_per_gas: Option<U256>,
}

/// Chain RPC operations used by the coordinator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Endpoint URL (the active one for failover wrappers)
    fn url(&self) -> &str;

    async fn get_block_number(&self) -> CoordinatorResult<u64>;

    async fn get_transaction_count(
        &self,
        address: Address,
        tag: BlockNumber,
    ) -> CoordinatorResult<u64>;

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> CoordinatorResult<Option<TransactionReceipt>>;

    /// Look up a transaction by hash; `None` when the node no longer knows it
    async fn get_transaction(&self, tx_hash: H256) -> CoordinatorResult<Option<Transaction>>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> CoordinatorResult<U256>;

    async fn get_fee_data(&self) -> CoordinatorResult<FeeData>;

    async fn send_raw_transaction(&self, raw: Bytes) -> CoordinatorResult<H256>;
}
