//! Process-wide coordination state, held explicitly
//!
//! Provider pairs and the nonce coordinator live for the whole process but
//! are owned by a `CoordinatorRegistry` value that callers inject, so tests
//! get a fresh one and `reset_*` gives deterministic teardown.

use crate::chain::{FailoverConfig, FailoverManager, ProviderRegistry};
use crate::error::CoordinatorResult;
use crate::state::NonceStore;
use crate::tx::{NonceConfig, NonceCoordinator, TransactionContext};

use std::sync::{Arc, RwLock};
use tracing::debug;

pub struct CoordinatorRegistry {
    providers: ProviderRegistry,
    store: Arc<dyn NonceStore>,
    nonce_config: NonceConfig,
    nonce_coordinator: RwLock<Option<Arc<NonceCoordinator>>>,
}

impl CoordinatorRegistry {
    pub fn new(
        store: Arc<dyn NonceStore>,
        nonce_config: NonceConfig,
        failover_config: FailoverConfig,
    ) -> Self {
        Self {
            providers: ProviderRegistry::new(failover_config),
            store,
            nonce_config,
            nonce_coordinator: RwLock::new(None),
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn store(&self) -> &Arc<dyn NonceStore> {
        &self.store
    }

    /// Failover manager for the context's endpoint pair
    pub fn provider_for(&self, context: &TransactionContext) -> CoordinatorResult<Arc<FailoverManager>> {
        self.providers
            .get_or_connect(&context.rpc_url, context.fallback_rpc_url.as_deref())
    }

    /// The shared coordinator, created on first use
    pub fn nonce_coordinator(&self) -> Arc<NonceCoordinator> {
        if let Ok(slot) = self.nonce_coordinator.read() {
            if let Some(coordinator) = slot.as_ref() {
                return coordinator.clone();
            }
        }

        let mut slot = match self.nonce_coordinator.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.get_or_insert_with(|| {
            debug!("Creating nonce coordinator");
            Arc::new(NonceCoordinator::new(
                self.store.clone(),
                self.nonce_config.clone(),
            ))
        })
        .clone()
    }

    /// Drop the shared coordinator; the next access creates a new one
    pub fn reset_nonce_coordinator(&self) {
        let mut slot = match self.nonce_coordinator.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
    }

    /// Forget all cached provider pairs
    pub fn reset_providers(&self) {
        self.providers.reset();
    }
}
