//! ethers-backed HTTP implementation of `ChainRpc`

use super::{ChainRpc, FeeData};
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::time::Duration;
use tracing::debug;

/// Tip used when the node does not implement `eth_maxPriorityFeePerGas`
const DEFAULT_PRIORITY_FEE_WEI: u64 = 1_000_000_000;

/// Single-endpoint JSON-RPC provider
pub struct EthersRpc {
    url: String,
    provider: Provider<Http>,
}

impl EthersRpc {
    /// Create a provider for one endpoint
    pub fn new(url: &str) -> CoordinatorResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| CoordinatorError::Config(format!("Invalid RPC URL {}: {}", url, e)))?
            .interval(Duration::from_millis(100));

        debug!("Created HTTP provider for {}", url);

        Ok(Self {
            url: url.to_string(),
            provider,
        })
    }

    fn rpc_error(&self, e: ProviderError) -> CoordinatorError {
        // A JSON-RPC error object means the node answered and refused the
        // call; anything else is a transport failure.
        if let Some(response) = RpcError::as_error_response(&e) {
            return CoordinatorError::RpcRejected {
                url: self.url.clone(),
                code: response.code,
                message: response.message.clone(),
            };
        }

        CoordinatorError::Rpc {
            url: self.url.clone(),
            message: e.to_string(),
        }
    }

    /// Node-suggested tip; only a node that refuses the method gets the default
    async fn max_priority_fee(&self) -> CoordinatorResult<U256> {
        match self
            .provider
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
        {
            Ok(fee) => Ok(fee),
            Err(e) if RpcError::as_error_response(&e).is_some() => {
                debug!("eth_maxPriorityFeePerGas unsupported on {}: {}", self.url, e);
                Ok(U256::from(DEFAULT_PRIORITY_FEE_WEI))
            }
            Err(e) => Err(self.rpc_error(e)),
        }
    }
}

#[async_trait]
impl ChainRpc for EthersRpc {
    fn url(&self) -> &str {
        &self.url
    }

    async fn get_block_number(&self) -> CoordinatorResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .map_err(|e| self.rpc_error(e))
    }

    async fn get_transaction_count(
        &self,
        address: Address,
        tag: BlockNumber,
    ) -> CoordinatorResult<u64> {
        let count = self
            .provider
            .get_transaction_count(address, Some(BlockId::Number(tag)))
            .await
            .map_err(|e| self.rpc_error(e))?;

        Ok(count.as_u64())
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> CoordinatorResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn get_transaction(&self, tx_hash: H256) -> CoordinatorResult<Option<Transaction>> {
        self.provider
            .get_transaction(tx_hash)
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> CoordinatorResult<U256> {
        self.provider
            .estimate_gas(tx, None)
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn get_fee_data(&self) -> CoordinatorResult<FeeData> {
        let gas_price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| self.rpc_error(e))?;

        let base_fee = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.rpc_error(e))?
            .and_then(|block| block.base_fee_per_gas);

        let fee_data = match base_fee {
            Some(base_fee) => {
                let priority_fee = self.max_priority_fee().await?;
                FeeData {
                    gas_price: Some(gas_price),
                    // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
                    max_fee_per_gas: Some(base_fee * 2 + priority_fee),
                    max_priority_fee_per_gas: Some(priority_fee),
                    base_fee_per_gas: Some(base_fee),
                }
            }
            None => FeeData {
                gas_price: Some(gas_price),
                ..FeeData::default()
            },
        };

        Ok(fee_data)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> CoordinatorResult<H256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| self.rpc_error(e))?;

        Ok(pending.tx_hash())
    }
}
