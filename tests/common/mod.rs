#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Bytes, Transaction, TransactionReceipt, H256, U256, U64,
};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use workflow_tx_coordinator::chain::{ChainRpc, FailoverConfig, FailoverManager, FeeData};
use workflow_tx_coordinator::state::MemoryStore;
use workflow_tx_coordinator::tx::{
    GasStrategy, LocalWalletSigner, NonceConfig, StaticWalletDirectory, SubmissionConfig,
    TransactionContext, TransactionOrchestrator, TransactionSigner, TriggerType,
};
use workflow_tx_coordinator::{CoordinatorError, CoordinatorRegistry, CoordinatorResult};

pub const SIGNER_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
pub const WALLET: &str = "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
pub const GWEI: u64 = 1_000_000_000;

#[derive(Default)]
struct ChainState {
    next_nonce: u64,
    block: u64,
    receipts: HashMap<H256, TransactionReceipt>,
    mempool: HashMap<H256, Transaction>,
    sent: Vec<Bytes>,
}

/// Scripted chain endpoint: every broadcast is mined immediately
pub struct FakeChain {
    url: String,
    state: Mutex<ChainState>,
    down: AtomicBool,
    revert: AtomicBool,
    rejection: Mutex<Option<String>>,
    calls: AtomicU64,
}

impl FakeChain {
    pub fn new(url: &str, next_nonce: u64) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            state: Mutex::new(ChainState {
                next_nonce,
                block: 100,
                ..ChainState::default()
            }),
            down: AtomicBool::new(false),
            revert: AtomicBool::new(false),
            rejection: Mutex::new(None),
            calls: AtomicU64::new(0),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_revert(&self, revert: bool) {
        self.revert.store(revert, Ordering::SeqCst);
    }

    /// Refuse every broadcast with a JSON-RPC error carrying `message`
    pub fn reject_sends(&self, message: &str) {
        *self.rejection.lock().unwrap() = Some(message.to_string());
    }

    pub fn accept_sends(&self) {
        *self.rejection.lock().unwrap() = None;
    }

    pub fn next_nonce(&self) -> u64 {
        self.state.lock().unwrap().next_nonce
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn add_receipt(&self, hash: H256) {
        let mut state = self.state.lock().unwrap();
        let block = state.block;
        state.receipts.insert(hash, receipt(hash, block, true));
    }

    pub fn add_to_mempool(&self, hash: H256) {
        let tx = Transaction {
            hash,
            ..Transaction::default()
        };
        self.state.lock().unwrap().mempool.insert(hash, tx);
    }

    fn check(&self) -> CoordinatorResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Rpc {
                url: self.url.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

fn receipt(hash: H256, block: u64, success: bool) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: hash,
        block_number: Some(U64::from(block)),
        gas_used: Some(U256::from(21_000u64)),
        status: Some(U64::from(u64::from(success))),
        ..TransactionReceipt::default()
    }
}

#[async_trait]
impl ChainRpc for FakeChain {
    fn url(&self) -> &str {
        &self.url
    }

    async fn get_block_number(&self) -> CoordinatorResult<u64> {
        self.check()?;
        Ok(self.state.lock().unwrap().block)
    }

    async fn get_transaction_count(
        &self,
        _address: Address,
        _tag: BlockNumber,
    ) -> CoordinatorResult<u64> {
        self.check()?;
        Ok(self.state.lock().unwrap().next_nonce)
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> CoordinatorResult<Option<TransactionReceipt>> {
        self.check()?;
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).cloned())
    }

    async fn get_transaction(&self, tx_hash: H256) -> CoordinatorResult<Option<Transaction>> {
        self.check()?;
        Ok(self.state.lock().unwrap().mempool.get(&tx_hash).cloned())
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> CoordinatorResult<U256> {
        self.check()?;
        Ok(U256::from(21_000u64))
    }

    async fn get_fee_data(&self) -> CoordinatorResult<FeeData> {
        self.check()?;
        let base = U256::from(10 * GWEI);
        let tip = U256::from(GWEI);
        Ok(FeeData {
            gas_price: Some(base + tip),
            max_fee_per_gas: Some(base * 2 + tip),
            max_priority_fee_per_gas: Some(tip),
            base_fee_per_gas: Some(base),
        })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> CoordinatorResult<H256> {
        self.check()?;
        if let Some(message) = self.rejection.lock().unwrap().clone() {
            return Err(CoordinatorError::RpcRejected {
                url: self.url.clone(),
                code: -32000,
                message,
            });
        }

        let hash = H256::from(keccak256(&raw));
        let success = !self.revert.load(Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        state.next_nonce += 1;
        state.block += 1;
        let block = state.block;
        state.receipts.insert(hash, receipt(hash, block, success));
        state.sent.push(raw);
        Ok(hash)
    }
}

/// Broadcasts on the first send but loses the response; later sends of the
/// same bytes are refused as already known
pub struct LossyChain {
    inner: Arc<FakeChain>,
    sends: AtomicU64,
}

impl LossyChain {
    pub fn new(inner: Arc<FakeChain>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            sends: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl ChainRpc for LossyChain {
    fn url(&self) -> &str {
        self.inner.url()
    }

    async fn get_block_number(&self) -> CoordinatorResult<u64> {
        self.inner.get_block_number().await
    }

    async fn get_transaction_count(
        &self,
        address: Address,
        tag: BlockNumber,
    ) -> CoordinatorResult<u64> {
        self.inner.get_transaction_count(address, tag).await
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> CoordinatorResult<Option<TransactionReceipt>> {
        self.inner.get_transaction_receipt(tx_hash).await
    }

    async fn get_transaction(&self, tx_hash: H256) -> CoordinatorResult<Option<Transaction>> {
        self.inner.get_transaction(tx_hash).await
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> CoordinatorResult<U256> {
        self.inner.estimate_gas(tx).await
    }

    async fn get_fee_data(&self) -> CoordinatorResult<FeeData> {
        self.inner.get_fee_data().await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> CoordinatorResult<H256> {
        if self.sends.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.send_raw_transaction(raw).await?;
            return Err(CoordinatorError::Rpc {
                url: self.url().to_string(),
                message: "connection reset by peer".to_string(),
            });
        }

        Err(CoordinatorError::RpcRejected {
            url: self.url().to_string(),
            code: -32000,
            message: "already known".to_string(),
        })
    }
}

pub fn fast_failover() -> FailoverConfig {
    FailoverConfig {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 2,
        timeout_ms: 1_000,
    }
}

pub fn fast_nonce() -> NonceConfig {
    NonceConfig {
        lock_timeout_ms: 60_000,
        lock_retry_delay_ms: 1,
        max_lock_retries: 20,
    }
}

pub fn context(chain: &FakeChain, execution_id: &str) -> TransactionContext {
    TransactionContext {
        organization_id: "org-1".to_string(),
        execution_id: execution_id.to_string(),
        workflow_id: Some("wf-1".to_string()),
        chain_id: 1,
        rpc_url: chain.url().to_string(),
        fallback_rpc_url: None,
        trigger_type: TriggerType::Manual,
    }
}

/// Orchestrator wired to fake chains and an in-memory store
pub struct Harness {
    pub store: MemoryStore,
    pub registry: Arc<CoordinatorRegistry>,
    pub orchestrator: TransactionOrchestrator,
    pub signer: Arc<LocalWalletSigner>,
}

impl Harness {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let registry = Arc::new(CoordinatorRegistry::new(
            Arc::new(store.clone()),
            fast_nonce(),
            fast_failover(),
        ));

        let signer = Arc::new(LocalWalletSigner::new(SIGNER_KEY.parse().unwrap()));
        let directory = StaticWalletDirectory::new();
        directory.register("org-1", signer.clone() as Arc<dyn TransactionSigner>);

        let orchestrator = TransactionOrchestrator::new(
            registry.clone(),
            Arc::new(directory),
            Arc::new(GasStrategy::default()),
            SubmissionConfig {
                inclusion_timeout_secs: 5,
                receipt_poll_interval_ms: 1,
            },
        );

        Self {
            store,
            registry,
            orchestrator,
            signer,
        }
    }

    /// Serve the pair (primary, fallback) from the given fakes
    pub fn route(&self, primary: Arc<FakeChain>, fallback: Option<Arc<FakeChain>>) -> Arc<FailoverManager> {
        self.route_rpc(primary, fallback.map(|f| f as Arc<dyn ChainRpc>))
    }

    pub fn route_rpc(
        &self,
        primary: Arc<dyn ChainRpc>,
        fallback: Option<Arc<dyn ChainRpc>>,
    ) -> Arc<FailoverManager> {
        let manager = Arc::new(FailoverManager::new(primary, fallback, fast_failover()));
        self.registry.providers().insert(manager.clone());
        manager
    }

    pub fn signer_address(&self) -> String {
        format!("{:?}", self.signer.address())
    }
}
