mod common;

use async_trait::async_trait;
use common::{context, FakeChain, Harness, LossyChain};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use workflow_tx_coordinator::state::{NonceStore, TxStatus, WalletKey};
use workflow_tx_coordinator::tx::{
    NonceCoordinator, NonceSession, SessionBody, StepOutcome, ValidationReport,
};
use workflow_tx_coordinator::{CoordinatorError, CoordinatorResult};

const RECIPIENT: &str = "0x00000000000000000000000000000000000000b0";
const TOKEN: &str = "0x00000000000000000000000000000000000000c0";

async fn assert_unlocked(harness: &Harness, chain_id: u64) {
    let key = WalletKey::new(&harness.signer_address(), chain_id).unwrap();
    let held = harness
        .store
        .get_lock(&key)
        .await
        .unwrap()
        .map(|lock| lock.is_held())
        .unwrap_or(false);
    assert!(!held, "lock for {} still held", key);
}

struct AllocateNonces {
    coordinator: Arc<NonceCoordinator>,
    count: usize,
}

#[async_trait]
impl SessionBody<Vec<u64>> for AllocateNonces {
    async fn run(
        self,
        session: &mut NonceSession,
        _report: &ValidationReport,
    ) -> CoordinatorResult<Vec<u64>> {
        Ok((0..self.count)
            .map(|_| self.coordinator.get_next_nonce(session))
            .collect())
    }
}

struct FailingBody;

#[async_trait]
impl SessionBody<()> for FailingBody {
    async fn run(self, _: &mut NonceSession, _: &ValidationReport) -> CoordinatorResult<()> {
        Err(CoordinatorError::GasPricing("no quote".to_string()))
    }
}

struct PanickingBody;

#[async_trait]
impl SessionBody<()> for PanickingBody {
    async fn run(self, _: &mut NonceSession, _: &ValidationReport) -> CoordinatorResult<()> {
        panic!("step blew up");
    }
}

struct FlagBody(Arc<AtomicBool>);

#[async_trait]
impl SessionBody<()> for FlagBody {
    async fn run(self, _: &mut NonceSession, _: &ValidationReport) -> CoordinatorResult<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn native_transfer_runs_end_to_end() {
    let harness = Harness::new();
    let chain = FakeChain::new("http://primary", 7);
    harness.route(chain.clone(), None);
    let ctx = context(&chain, "exec-1");

    let outcome = harness
        .orchestrator
        .transfer_native(&ctx, RECIPIENT, "1000000000000000")
        .await;

    let result = outcome.result().expect("transfer should succeed");
    assert_eq!(result.nonce, 7);
    assert_eq!(result.chain_id, 1);
    assert_eq!(result.block_number, Some(101));
    assert_eq!(chain.sent_count(), 1);

    let key = WalletKey::new(&harness.signer_address(), 1).unwrap();
    let row = harness.store.get_transaction(&key, 7).await.unwrap().unwrap();
    assert_eq!(row.status, TxStatus::Confirmed);
    assert_eq!(row.tx_hash, result.tx_hash);
    assert_eq!(row.workflow_id.as_deref(), Some("wf-1"));
    assert_unlocked(&harness, 1).await;
}

#[tokio::test]
async fn consecutive_steps_use_consecutive_nonces() {
    let harness = Harness::new();
    let chain = FakeChain::new("http://primary", 3);
    harness.route(chain.clone(), None);

    let first = harness
        .orchestrator
        .transfer_token(&context(&chain, "exec-1"), TOKEN, RECIPIENT, "500")
        .await;
    let second = harness
        .orchestrator
        .call_contract(
            &context(&chain, "exec-2"),
            TOKEN,
            "approve(address,uint256)",
            &[RECIPIENT.to_string(), "25".to_string()],
            None,
        )
        .await;

    assert_eq!(first.result().unwrap().nonce, 3);
    assert_eq!(second.result().unwrap().nonce, 4);
    assert_eq!(chain.next_nonce(), 5);
    assert_unlocked(&harness, 1).await;
}

#[tokio::test]
async fn invalid_input_touches_nothing() {
    let harness = Harness::new();
    let chain = FakeChain::new("http://primary", 0);
    harness.route(chain.clone(), None);
    let ctx = context(&chain, "exec-1");

    let zero = harness.orchestrator.transfer_native(&ctx, RECIPIENT, "0").await;
    let bad_to = harness.orchestrator.transfer_native(&ctx, "0x12", "5").await;
    let bad_args = harness
        .orchestrator
        .call_contract(&ctx, TOKEN, "approve(address,uint256)", &["1".to_string()], None)
        .await;

    for outcome in [zero, bad_to, bad_args] {
        assert_eq!(outcome.error_kind(), Some("validation"));
    }
    assert_eq!(chain.calls(), 0);

    let key = WalletKey::new(&harness.signer_address(), 1).unwrap();
    assert!(harness.store.get_lock(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_organization_is_a_context_failure() {
    let harness = Harness::new();
    let chain = FakeChain::new("http://primary", 0);
    harness.route(chain.clone(), None);

    let mut ctx = context(&chain, "exec-1");
    ctx.organization_id = "org-missing".to_string();

    let outcome = harness.orchestrator.transfer_native(&ctx, RECIPIENT, "5").await;
    match outcome {
        StepOutcome::Failure { kind, error } => {
            assert_eq!(kind, "context_resolution");
            assert!(error.contains("org-missing"));
        }
        StepOutcome::Success { .. } => panic!("expected failure"),
    }
    assert_eq!(chain.calls(), 0);
}

#[tokio::test]
async fn reverted_transaction_consumes_nonce_and_fails() {
    let harness = Harness::new();
    let chain = FakeChain::new("http://primary", 9);
    chain.set_revert(true);
    harness.route(chain.clone(), None);

    let outcome = harness
        .orchestrator
        .transfer_native(&context(&chain, "exec-1"), RECIPIENT, "5")
        .await;
    assert_eq!(outcome.error_kind(), Some("reverted"));

    let key = WalletKey::new(&harness.signer_address(), 1).unwrap();
    let row = harness.store.get_transaction(&key, 9).await.unwrap().unwrap();
    assert_eq!(row.status, TxStatus::Confirmed);
    assert_unlocked(&harness, 1).await;
}

#[tokio::test]
async fn submission_fails_over_and_recovers() {
    let harness = Harness::new();
    let primary = FakeChain::new("http://primary", 0);
    let fallback = FakeChain::new("http://fallback", 0);
    primary.set_down(true);
    let manager = harness.route(primary.clone(), Some(fallback.clone()));

    let mut ctx = context(&primary, "exec-1");
    ctx.fallback_rpc_url = Some("http://fallback".to_string());

    let outcome = harness.orchestrator.transfer_native(&ctx, RECIPIENT, "5").await;
    assert!(outcome.is_success());
    assert!(manager.is_currently_using_fallback());
    assert_eq!(fallback.sent_count(), 1);
    assert_eq!(primary.sent_count(), 0);

    primary.set_down(false);
    assert!(manager.try_recover_primary().await);
    assert!(!manager.is_currently_using_fallback());
    assert_eq!(manager.state_snapshot().recovery_count, 1);
}

#[tokio::test]
async fn lost_broadcast_response_still_confirms() {
    let harness = Harness::new();
    let chain = FakeChain::new("http://primary", 5);
    harness.route_rpc(LossyChain::new(chain.clone()), None);

    let outcome = harness
        .orchestrator
        .transfer_native(&context(&chain, "exec-1"), RECIPIENT, "5")
        .await;

    let result = outcome.result().expect("broadcast landed, step must succeed");
    assert_eq!(result.nonce, 5);
    assert_eq!(chain.sent_count(), 1);
    assert_eq!(chain.next_nonce(), 6);

    let key = WalletKey::new(&harness.signer_address(), 1).unwrap();
    let row = harness.store.get_transaction(&key, 5).await.unwrap().unwrap();
    assert_eq!(row.status, TxStatus::Confirmed);
    assert_eq!(row.tx_hash, result.tx_hash);
    assert_unlocked(&harness, 1).await;
}

#[tokio::test]
async fn rejected_broadcast_is_reconciled_as_dropped() {
    let harness = Harness::new();
    let chain = FakeChain::new("http://primary", 2);
    chain.reject_sends("insufficient funds for gas * price + value");
    harness.route(chain.clone(), None);

    let outcome = harness
        .orchestrator
        .transfer_native(&context(&chain, "exec-1"), RECIPIENT, "5")
        .await;
    assert_eq!(outcome.error_kind(), Some("rpc_rejected"));
    assert_unlocked(&harness, 1).await;

    // The signed transaction was recorded before the send.
    let key = WalletKey::new(&harness.signer_address(), 1).unwrap();
    let row = harness.store.get_transaction(&key, 2).await.unwrap().unwrap();
    assert_eq!(row.status, TxStatus::Pending);

    chain.accept_sends();
    let coordinator = harness.registry.nonce_coordinator();
    let (session, report) = coordinator
        .start_session(&harness.signer_address(), 1, "exec-2", chain.as_ref())
        .await
        .unwrap();
    assert_eq!(session.current_nonce(), 2);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("dropped from mempool")));
    coordinator.end_session(session).await.unwrap();

    let row = harness.store.get_transaction(&key, 2).await.unwrap().unwrap();
    assert_eq!(row.status, TxStatus::Dropped);
}

#[tokio::test]
async fn session_ends_when_body_fails() {
    let harness = Harness::new();
    let chain = FakeChain::new("http://primary", 0);
    harness.route(chain.clone(), None);
    let ctx = context(&chain, "exec-1");

    let err = harness
        .orchestrator
        .with_nonce_session(&ctx, &harness.signer_address(), FailingBody)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "gas_pricing");
    assert_unlocked(&harness, 1).await;
}

#[tokio::test]
async fn session_ends_when_body_panics() {
    let harness = Harness::new();
    let chain = FakeChain::new("http://primary", 11);
    harness.route(chain.clone(), None);
    let ctx = context(&chain, "exec-1");
    let wallet = harness.signer_address();

    let caught = AssertUnwindSafe(
        harness
            .orchestrator
            .with_nonce_session(&ctx, &wallet, PanickingBody),
    )
    .catch_unwind()
    .await;
    assert!(caught.is_err());
    assert_unlocked(&harness, 1).await;

    let body = AllocateNonces {
        coordinator: harness.registry.nonce_coordinator(),
        count: 3,
    };
    let nonces = harness
        .orchestrator
        .with_nonce_session(&context(&chain, "exec-2"), &wallet, body)
        .await
        .unwrap();
    assert_eq!(nonces, vec![11, 12, 13]);
}

#[tokio::test]
async fn body_never_runs_without_a_session() {
    let harness = Harness::new();
    let chain = FakeChain::new("http://primary", 0);
    chain.set_down(true);
    harness.route(chain.clone(), None);

    let ran = Arc::new(AtomicBool::new(false));
    let err = harness
        .orchestrator
        .with_nonce_session(
            &context(&chain, "exec-1"),
            &harness.signer_address(),
            FlagBody(ran.clone()),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "all_endpoints_failed");
    assert!(!ran.load(Ordering::SeqCst));
    assert_unlocked(&harness, 1).await;
}
