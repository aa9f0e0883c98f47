//! Process-wide cache of failover managers keyed by endpoint pair

use super::{FailoverConfig, FailoverManager, RpcStateSnapshot};
use crate::error::CoordinatorResult;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

type PairKey = (String, Option<String>);

/// One `FailoverManager` per (primary, fallback) pair, so failover state
/// survives across calls from different executions.
pub struct ProviderRegistry {
    config: FailoverConfig,
    managers: DashMap<PairKey, Arc<FailoverManager>>,
}

impl ProviderRegistry {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            managers: DashMap::new(),
        }
    }

    /// Get the cached manager for a pair, connecting it on first use
    pub fn get_or_connect(
        &self,
        primary_url: &str,
        fallback_url: Option<&str>,
    ) -> CoordinatorResult<Arc<FailoverManager>> {
        let key = (primary_url.to_string(), fallback_url.map(str::to_string));

        if let Some(manager) = self.managers.get(&key) {
            return Ok(manager.clone());
        }

        let entry = self.managers.entry(key).or_try_insert_with(|| {
            let manager = FailoverManager::connect(primary_url, fallback_url, self.config.clone())?;
            manager.on_state_change(Arc::new(crate::metrics::record_rpc_state_change));
            info!(
                "Created RPC manager for {} (fallback: {})",
                primary_url,
                fallback_url.unwrap_or("none")
            );
            Ok::<_, crate::error::CoordinatorError>(Arc::new(manager))
        })?;

        Ok(entry.value().clone())
    }

    /// Install a pre-built manager for a pair, replacing any cached one
    pub fn insert(&self, manager: Arc<FailoverManager>) {
        let key = (
            manager.primary_url().to_string(),
            manager.fallback_url().map(str::to_string),
        );
        self.managers.insert(key, manager);
    }

    /// Probe every manager currently on its fallback
    pub async fn probe_primaries(&self) -> Vec<(String, bool)> {
        let managers: Vec<_> = self.managers.iter().map(|e| e.value().clone()).collect();
        let mut results = Vec::with_capacity(managers.len());

        for manager in managers {
            if manager.is_currently_using_fallback() {
                let recovered = manager.try_recover_primary().await;
                results.push((manager.primary_url().to_string(), recovered));
            }
        }

        results
    }

    pub fn snapshots(&self) -> Vec<RpcStateSnapshot> {
        self.managers
            .iter()
            .map(|entry| entry.value().state_snapshot())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Drop every cached manager
    pub fn reset(&self) {
        self.managers.clear();
    }
}
