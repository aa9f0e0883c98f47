//! Signing capability used by the orchestrator

use crate::chain::ChainRpc;
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use tracing::{info, warn};

/// Produces an address and signed transaction bytes
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;

    /// Sign and RLP-encode a transaction
    async fn sign_transaction(&self, tx: TypedTransaction) -> CoordinatorResult<Bytes>;

    /// Sign, then broadcast through `provider`
    async fn send_transaction(
        &self,
        tx: TypedTransaction,
        provider: &dyn ChainRpc,
    ) -> CoordinatorResult<H256> {
        let raw = self.sign_transaction(tx).await?;
        broadcast(provider, raw).await
    }
}

/// Hash of signed transaction bytes, known before anything is sent
pub fn signed_tx_hash(raw: &Bytes) -> H256 {
    H256::from(keccak256(raw))
}

/// Broadcast signed bytes and return their locally derived hash
///
/// A broadcast can land while its response is lost, so a re-send of the same
/// bytes may be refused as already known. That refusal means the transaction
/// is out and resolves to success. "nonce too low" only does so when the
/// node can already see this exact hash.
pub async fn broadcast(provider: &dyn ChainRpc, raw: Bytes) -> CoordinatorResult<H256> {
    let tx_hash = signed_tx_hash(&raw);

    match provider.send_raw_transaction(raw).await {
        Ok(returned) => {
            if returned != tx_hash {
                warn!(
                    "{} returned hash {:?} for signed transaction {:?}",
                    provider.url(),
                    returned,
                    tx_hash
                );
            }
            Ok(tx_hash)
        }
        Err(e) if e.is_known_transaction() => {
            info!("{:?} already accepted by {}: {}", tx_hash, provider.url(), e);
            Ok(tx_hash)
        }
        Err(e) if e.is_nonce_too_low() => {
            let mined = provider.get_transaction_receipt(tx_hash).await?.is_some();
            if mined || provider.get_transaction(tx_hash).await?.is_some() {
                info!("{:?} already on chain despite rejection: {}", tx_hash, e);
                Ok(tx_hash)
            } else {
                Err(e)
            }
        }
        Err(e) => Err(e),
    }
}

/// Signer over an in-process private key, for development
pub struct LocalWalletSigner {
    wallet: LocalWallet,
}

impl LocalWalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Load the key from an environment variable
    pub fn from_env(var: &str) -> CoordinatorResult<Self> {
        let key = std::env::var(var).map_err(|_| {
            CoordinatorError::Signer(format!("No wallet configured. Set {}", var))
        })?;

        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| CoordinatorError::Signer(format!("Invalid private key: {}", e)))?;

        info!("Loaded development signer {:?}", wallet.address());
        Ok(Self::new(wallet))
    }
}

#[async_trait]
impl TransactionSigner for LocalWalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_transaction(&self, mut tx: TypedTransaction) -> CoordinatorResult<Bytes> {
        tx.set_from(self.wallet.address());

        let wallet = match tx.chain_id() {
            Some(chain_id) => self.wallet.clone().with_chain_id(chain_id.as_u64()),
            None => self.wallet.clone(),
        };

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| CoordinatorError::Signer(e.to_string()))?;

        Ok(tx.rlp_signed(&signature))
    }
}
