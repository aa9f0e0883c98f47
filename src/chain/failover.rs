//! Primary/fallback RPC failover with bounded retries
//!
//! Every call runs against the endpoint currently considered healthy. Each
//! attempt is bounded by a timeout, failures back off exponentially, and a
//! primary that exhausts its retries hands over to the fallback. While on the
//! fallback, a failing call probes the primary before giving up, and any
//! successful primary call switches back.

use super::{ChainRpc, EthersRpc, FeeData};
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, Transaction, TransactionReceipt, H256, U256};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Retry and timeout policy for one endpoint pair
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Attempts per endpoint before giving up on it
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Bound on a single RPC attempt
    pub timeout_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            timeout_ms: 30_000,
        }
    }
}

impl FailoverConfig {
    /// Longest one call can take: both endpoints exhaust their attempts at the
    /// attempt timeout, with backoff between attempts
    pub fn call_budget_ms(&self) -> u64 {
        let attempts = u64::from(self.max_retries.max(1));
        let mut backoff = 0u64;
        let mut delay = self.base_delay_ms;
        for _ in 1..attempts {
            backoff = backoff.saturating_add(delay);
            delay = delay.saturating_mul(2).min(self.max_delay_ms);
        }

        attempts
            .saturating_mul(self.timeout_ms)
            .saturating_add(backoff)
            .saturating_mul(2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Primary,
    Fallback,
}

impl Endpoint {
    fn label(&self) -> &'static str {
        match self {
            Endpoint::Primary => "primary",
            Endpoint::Fallback => "fallback",
        }
    }
}

/// Failover state transitions reported to observers
#[derive(Debug, Clone, PartialEq)]
pub enum RpcStateChange {
    Failover {
        primary_url: String,
        fallback_url: String,
        at: DateTime<Utc>,
    },
    Recovery {
        primary_url: String,
        at: DateTime<Utc>,
    },
}

/// Observer invoked on every state change
pub type StateChangeCallback = Arc<dyn Fn(&RpcStateChange) + Send + Sync>;

#[derive(Debug, Default)]
struct RpcManagerState {
    using_fallback: AtomicBool,
    total_attempts: AtomicU64,
    primary_failures: AtomicU64,
    fallback_failures: AtomicU64,
    failover_count: AtomicU64,
    recovery_count: AtomicU64,
    last_failover: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time view of a manager's state
#[derive(Debug, Clone, Serialize)]
pub struct RpcStateSnapshot {
    pub primary_url: String,
    pub fallback_url: Option<String>,
    pub using_fallback: bool,
    pub total_attempts: u64,
    pub primary_failures: u64,
    pub fallback_failures: u64,
    pub failover_count: u64,
    pub recovery_count: u64,
    pub last_failover_time: Option<DateTime<Utc>>,
}

/// Wraps a primary and optional fallback endpoint behind one provider
pub struct FailoverManager {
    primary: Arc<dyn ChainRpc>,
    fallback: Option<Arc<dyn ChainRpc>>,
    config: FailoverConfig,
    state: RpcManagerState,
    observers: RwLock<Vec<StateChangeCallback>>,
}

impl FailoverManager {
    /// Create a manager over existing providers
    pub fn new(
        primary: Arc<dyn ChainRpc>,
        fallback: Option<Arc<dyn ChainRpc>>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            config,
            state: RpcManagerState::default(),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Create a manager over HTTP endpoints
    pub fn connect(
        primary_url: &str,
        fallback_url: Option<&str>,
        config: FailoverConfig,
    ) -> CoordinatorResult<Self> {
        let primary: Arc<dyn ChainRpc> = Arc::new(EthersRpc::new(primary_url)?);
        let fallback = match fallback_url {
            Some(url) => Some(Arc::new(EthersRpc::new(url)?) as Arc<dyn ChainRpc>),
            None => None,
        };

        Ok(Self::new(primary, fallback, config))
    }

    /// Register an observer for failover and recovery events
    pub fn on_state_change(&self, callback: StateChangeCallback) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(callback);
        }
    }

    pub fn is_currently_using_fallback(&self) -> bool {
        self.state.using_fallback.load(Ordering::SeqCst)
    }

    pub fn primary_url(&self) -> &str {
        self.primary.url()
    }

    pub fn fallback_url(&self) -> Option<&str> {
        self.fallback.as_ref().map(|f| f.url())
    }

    pub fn state_snapshot(&self) -> RpcStateSnapshot {
        RpcStateSnapshot {
            primary_url: self.primary.url().to_string(),
            fallback_url: self.fallback_url().map(str::to_string),
            using_fallback: self.is_currently_using_fallback(),
            total_attempts: self.state.total_attempts.load(Ordering::Relaxed),
            primary_failures: self.state.primary_failures.load(Ordering::Relaxed),
            fallback_failures: self.state.fallback_failures.load(Ordering::Relaxed),
            failover_count: self.state.failover_count.load(Ordering::Relaxed),
            recovery_count: self.state.recovery_count.load(Ordering::Relaxed),
            last_failover_time: self.state.last_failover.lock().ok().and_then(|t| *t),
        }
    }

    /// Run an operation against the best available endpoint
    pub async fn execute_with_failover<T, F, Fut>(&self, operation: F) -> CoordinatorResult<T>
    where
        F: Fn(Arc<dyn ChainRpc>) -> Fut,
        Fut: Future<Output = CoordinatorResult<T>>,
    {
        if self.is_currently_using_fallback() {
            if let Some(fallback) = &self.fallback {
                let fallback_error = match self
                    .run_with_retries(Endpoint::Fallback, fallback, &operation)
                    .await
                {
                    Ok(value) => return Ok(value),
                    Err(e) if !e.is_retryable() => return Err(e),
                    Err(e) => e,
                };

                warn!(
                    "Fallback {} exhausted retries, probing primary {}",
                    fallback.url(),
                    self.primary.url()
                );

                return match self
                    .run_with_retries(Endpoint::Primary, &self.primary, &operation)
                    .await
                {
                    Ok(value) => {
                        self.mark_recovered();
                        Ok(value)
                    }
                    Err(e) if !e.is_retryable() => Err(e),
                    Err(primary_error) => Err(self.aggregate(primary_error, Some(fallback_error))),
                };
            }
        }

        let primary_error = match self
            .run_with_retries(Endpoint::Primary, &self.primary, &operation)
            .await
        {
            Ok(value) => {
                self.mark_recovered();
                return Ok(value);
            }
            // The node answered; another endpoint would answer the same.
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        let Some(fallback) = &self.fallback else {
            return Err(self.aggregate(primary_error, None));
        };

        warn!(
            "Primary {} exhausted {} retries ({}), failing over to {}",
            self.primary.url(),
            self.config.max_retries,
            primary_error,
            fallback.url()
        );
        self.state.failover_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.state.last_failover.lock() {
            *last = Some(Utc::now());
        }

        match self
            .run_with_retries(Endpoint::Fallback, fallback, &operation)
            .await
        {
            Ok(value) => {
                self.adopt_fallback(fallback.url());
                Ok(value)
            }
            Err(e) if !e.is_retryable() => Err(e),
            Err(fallback_error) => Err(self.aggregate(primary_error, Some(fallback_error))),
        }
    }

    /// Probe the primary with a cheap call and switch back if it answers
    pub async fn try_recover_primary(&self) -> bool {
        if !self.is_currently_using_fallback() {
            return true;
        }

        let probe = timeout(self.attempt_timeout(), self.primary.get_block_number()).await;
        match probe {
            Ok(Ok(block)) => {
                debug!("Primary {} answered probe at block {}", self.primary.url(), block);
                self.mark_recovered();
                true
            }
            _ => false,
        }
    }

    async fn run_with_retries<T, F, Fut>(
        &self,
        endpoint: Endpoint,
        provider: &Arc<dyn ChainRpc>,
        operation: &F,
    ) -> CoordinatorResult<T>
    where
        F: Fn(Arc<dyn ChainRpc>) -> Fut,
        Fut: Future<Output = CoordinatorResult<T>>,
    {
        let mut delay = Duration::from_millis(self.config.base_delay_ms);
        let max_delay = Duration::from_millis(self.config.max_delay_ms);
        let max_retries = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_retries {
            self.state.total_attempts.fetch_add(1, Ordering::Relaxed);

            let error = match timeout(self.attempt_timeout(), operation(provider.clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => CoordinatorError::Timeout {
                    operation: format!("RPC call to {}", provider.url()),
                },
            };

            match endpoint {
                Endpoint::Primary => self.state.primary_failures.fetch_add(1, Ordering::Relaxed),
                Endpoint::Fallback => self.state.fallback_failures.fetch_add(1, Ordering::Relaxed),
            };

            debug!(
                "{} RPC attempt {}/{} against {} failed: {}",
                endpoint.label(),
                attempt,
                max_retries,
                provider.url(),
                error
            );
            last_error = Some(error);

            if attempt < max_retries {
                sleep(delay).await;
                delay = std::cmp::min(delay * 2, max_delay);
            }
        }

        Err(last_error.unwrap_or_else(|| CoordinatorError::Internal("no RPC attempt made".into())))
    }

    fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn adopt_fallback(&self, fallback_url: &str) {
        if !self.state.using_fallback.swap(true, Ordering::SeqCst) {
            info!(
                "Switched RPC from primary {} to fallback {}",
                self.primary.url(),
                fallback_url
            );
            self.notify(RpcStateChange::Failover {
                primary_url: self.primary.url().to_string(),
                fallback_url: fallback_url.to_string(),
                at: Utc::now(),
            });
        }
    }

    fn mark_recovered(&self) {
        if self.state.using_fallback.swap(false, Ordering::SeqCst) {
            self.state.recovery_count.fetch_add(1, Ordering::Relaxed);
            info!("Primary RPC {} recovered", self.primary.url());
            self.notify(RpcStateChange::Recovery {
                primary_url: self.primary.url().to_string(),
                at: Utc::now(),
            });
        }
    }

    fn notify(&self, change: RpcStateChange) {
        if let Ok(observers) = self.observers.read() {
            for observer in observers.iter() {
                observer(&change);
            }
        }
    }

    fn aggregate(
        &self,
        primary_error: CoordinatorError,
        fallback_error: Option<CoordinatorError>,
    ) -> CoordinatorError {
        CoordinatorError::AllEndpointsFailed {
            primary_url: self.primary.url().to_string(),
            primary_error: primary_error.to_string(),
            fallback_url: self.fallback_url().map(str::to_string),
            fallback_error: fallback_error.map(|e| e.to_string()),
        }
    }
}

#[async_trait]
impl ChainRpc for FailoverManager {
    fn url(&self) -> &str {
        match &self.fallback {
            Some(fallback) if self.is_currently_using_fallback() => fallback.url(),
            _ => self.primary.url(),
        }
    }

    async fn get_block_number(&self) -> CoordinatorResult<u64> {
        self.execute_with_failover(|p| async move { p.get_block_number().await })
            .await
    }

    async fn get_transaction_count(
        &self,
        address: Address,
        tag: BlockNumber,
    ) -> CoordinatorResult<u64> {
        self.execute_with_failover(|p| async move { p.get_transaction_count(address, tag).await })
            .await
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> CoordinatorResult<Option<TransactionReceipt>> {
        self.execute_with_failover(|p| async move { p.get_transaction_receipt(tx_hash).await })
            .await
    }

    async fn get_transaction(&self, tx_hash: H256) -> CoordinatorResult<Option<Transaction>> {
        self.execute_with_failover(|p| async move { p.get_transaction(tx_hash).await })
            .await
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> CoordinatorResult<U256> {
        self.execute_with_failover(|p| {
            let tx = tx.clone();
            async move { p.estimate_gas(&tx).await }
        })
        .await
    }

    async fn get_fee_data(&self) -> CoordinatorResult<FeeData> {
        self.execute_with_failover(|p| async move { p.get_fee_data().await })
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> CoordinatorResult<H256> {
        self.execute_with_failover(|p| {
            let raw = raw.clone();
            async move { p.send_raw_transaction(raw).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainRpc;
    use std::sync::atomic::AtomicUsize;

    fn endpoint(url: &str) -> Arc<dyn ChainRpc> {
        let mut mock = MockChainRpc::new();
        mock.expect_url().return_const(url.to_string());
        Arc::new(mock)
    }

    fn fast_config() -> FailoverConfig {
        FailoverConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            timeout_ms: 50,
        }
    }

    fn manager(with_fallback: bool) -> FailoverManager {
        FailoverManager::new(
            endpoint("http://primary"),
            with_fallback.then(|| endpoint("http://fallback")),
            fast_config(),
        )
    }

    fn transport_error(url: &str) -> CoordinatorError {
        CoordinatorError::Rpc {
            url: url.to_string(),
            message: "connection reset".to_string(),
        }
    }

    /// Operation that fails on endpoints whose URL is in `failing`
    async fn scripted(
        provider: Arc<dyn ChainRpc>,
        failing: Arc<RwLock<Vec<&'static str>>>,
        calls: Arc<AtomicUsize>,
    ) -> CoordinatorResult<String> {
        calls.fetch_add(1, Ordering::SeqCst);
        let url = provider.url().to_string();
        if failing.read().unwrap().iter().any(|f| *f == url) {
            Err(transport_error(&url))
        } else {
            Ok(url)
        }
    }

    #[tokio::test]
    async fn test_primary_success_stays_on_primary() {
        let manager = manager(true);
        let failing = Arc::new(RwLock::new(vec![]));
        let calls = Arc::new(AtomicUsize::new(0));

        let url = manager
            .execute_with_failover(|p| scripted(p, failing.clone(), calls.clone()))
            .await
            .unwrap();

        assert_eq!(url, "http://primary");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_currently_using_fallback());
    }

    #[tokio::test]
    async fn test_fails_over_after_max_retries_and_recovers() {
        let manager = manager(true);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        manager.on_state_change(Arc::new(move |change| {
            sink.lock().unwrap().push(change.clone());
        }));

        let failing = Arc::new(RwLock::new(vec!["http://primary"]));
        let calls = Arc::new(AtomicUsize::new(0));

        let url = manager
            .execute_with_failover(|p| scripted(p, failing.clone(), calls.clone()))
            .await
            .unwrap();
        assert_eq!(url, "http://fallback");
        // three primary attempts, one fallback attempt
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(manager.is_currently_using_fallback());

        let snapshot = manager.state_snapshot();
        assert_eq!(snapshot.primary_failures, 3);
        assert_eq!(snapshot.failover_count, 1);
        assert!(snapshot.last_failover_time.is_some());

        // Fallback degrades while primary comes back: the probe flips state back.
        *failing.write().unwrap() = vec!["http://fallback"];
        let url = manager
            .execute_with_failover(|p| scripted(p, failing.clone(), calls.clone()))
            .await
            .unwrap();
        assert_eq!(url, "http://primary");
        assert!(!manager.is_currently_using_fallback());
        assert_eq!(manager.state_snapshot().recovery_count, 1);

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], RpcStateChange::Failover { .. }));
        assert!(matches!(changes[1], RpcStateChange::Recovery { .. }));
    }

    #[tokio::test]
    async fn test_on_fallback_tries_fallback_first() {
        let manager = manager(true);
        let failing = Arc::new(RwLock::new(vec!["http://primary"]));
        let calls = Arc::new(AtomicUsize::new(0));

        manager
            .execute_with_failover(|p| scripted(p, failing.clone(), calls.clone()))
            .await
            .unwrap();
        calls.store(0, Ordering::SeqCst);

        let url = manager
            .execute_with_failover(|p| scripted(p, failing.clone(), calls.clone()))
            .await
            .unwrap();
        assert_eq!(url, "http://fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.url(), "http://fallback");
    }

    #[tokio::test]
    async fn test_both_endpoints_failing_aggregates_errors() {
        let manager = manager(true);
        let failing = Arc::new(RwLock::new(vec!["http://primary", "http://fallback"]));
        let calls = Arc::new(AtomicUsize::new(0));

        let err = manager
            .execute_with_failover(|p| scripted(p, failing.clone(), calls.clone()))
            .await
            .unwrap_err();

        match err {
            CoordinatorError::AllEndpointsFailed {
                primary_url,
                fallback_url,
                fallback_error,
                ..
            } => {
                assert_eq!(primary_url, "http://primary");
                assert_eq!(fallback_url.as_deref(), Some("http://fallback"));
                assert!(fallback_error.unwrap().contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(!manager.is_currently_using_fallback());
    }

    #[tokio::test]
    async fn test_without_fallback_reports_primary_error() {
        let manager = manager(false);
        let failing = Arc::new(RwLock::new(vec!["http://primary"]));
        let calls = Arc::new(AtomicUsize::new(0));

        let err = manager
            .execute_with_failover(|p| scripted(p, failing.clone(), calls.clone()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::AllEndpointsFailed { fallback_url: None, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let manager = manager(true);
        let calls = Arc::new(AtomicUsize::new(0));

        let url = manager
            .execute_with_failover(|p| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if p.url() == "http://primary" {
                        sleep(Duration::from_millis(500)).await;
                    }
                    Ok(p.url().to_string())
                }
            })
            .await
            .unwrap();

        assert_eq!(url, "http://fallback");
        assert_eq!(manager.state_snapshot().primary_failures, 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let manager = manager(true);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = manager
            .execute_with_failover(|p| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(CoordinatorError::RpcRejected {
                        url: p.url().to_string(),
                        code: -32000,
                        message: "execution reverted".to_string(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::RpcRejected { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_currently_using_fallback());
    }

    #[tokio::test]
    async fn test_fallback_rejection_is_returned_as_is() {
        let manager = manager(true);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = manager
            .execute_with_failover(|p| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let url = p.url().to_string();
                    if url == "http://primary" {
                        Err::<(), _>(transport_error(&url))
                    } else {
                        Err(CoordinatorError::RpcRejected {
                            url,
                            code: -32000,
                            message: "already known".to_string(),
                        })
                    }
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_known_transaction());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_call_budget_covers_both_endpoints() {
        // 3 attempts x 30s plus 1s + 2s backoff, on each endpoint
        assert_eq!(FailoverConfig::default().call_budget_ms(), 186_000);
        assert_eq!(fast_config().call_budget_ms(), 2 * (3 * 50 + 1 + 2));
    }
}
