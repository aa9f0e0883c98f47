//! Execution context and step results exchanged with the workflow engine

use super::gas::PricingStrategy;
use super::signer::TransactionSigner;
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// What started the workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Schedule,
    Webhook,
    Event,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Schedule => "schedule",
            TriggerType::Webhook => "webhook",
            TriggerType::Event => "event",
        }
    }

    /// No user is watching, so a stuck transaction goes unnoticed
    pub fn is_unattended(&self) -> bool {
        !matches!(self, TriggerType::Manual)
    }
}

impl FromStr for TriggerType {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(TriggerType::Manual),
            "schedule" => Ok(TriggerType::Schedule),
            "webhook" => Ok(TriggerType::Webhook),
            "event" => Ok(TriggerType::Event),
            other => Err(CoordinatorError::Validation(format!(
                "Unknown trigger type {}",
                other
            ))),
        }
    }
}

/// Per-step context supplied by the workflow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionContext {
    pub organization_id: String,
    pub execution_id: String,
    pub workflow_id: Option<String>,
    pub chain_id: u64,
    pub rpc_url: String,
    pub fallback_rpc_url: Option<String>,
    pub trigger_type: TriggerType,
}

/// A call ready to be nonced, priced and signed
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit_override: Option<U256>,
    pub gas_multiplier_override: Option<f64>,
}

/// Result of a confirmed submission
#[derive(Debug, Clone, Serialize)]
pub struct TransactionOutcome {
    pub tx_hash: String,
    pub nonce: u64,
    pub chain_id: u64,
    pub block_number: Option<u64>,
    pub gas_used: Option<String>,
    pub strategy: PricingStrategy,
    pub volatility_warning: bool,
    /// Reconciliation warnings from the session start
    pub warnings: Vec<String>,
}

/// Step result handed back to the workflow engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepOutcome<T> {
    Success { result: T },
    Failure { error: String, kind: String },
}

impl<T> StepOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }

    pub fn result(&self) -> Option<&T> {
        match self {
            StepOutcome::Success { result } => Some(result),
            StepOutcome::Failure { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<&str> {
        match self {
            StepOutcome::Success { .. } => None,
            StepOutcome::Failure { kind, .. } => Some(kind),
        }
    }
}

impl<T> From<CoordinatorResult<T>> for StepOutcome<T> {
    fn from(result: CoordinatorResult<T>) -> Self {
        match result {
            Ok(result) => StepOutcome::Success { result },
            Err(e) => StepOutcome::Failure {
                error: e.to_string(),
                kind: e.kind().to_string(),
            },
        }
    }
}

/// Resolves the signing wallet for an organization
#[async_trait]
pub trait WalletDirectory: Send + Sync {
    async fn signer_for(
        &self,
        organization_id: &str,
    ) -> CoordinatorResult<Option<Arc<dyn TransactionSigner>>>;
}

/// Fixed organization-to-signer table
#[derive(Default)]
pub struct StaticWalletDirectory {
    signers: DashMap<String, Arc<dyn TransactionSigner>>,
}

impl StaticWalletDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, organization_id: impl Into<String>, signer: Arc<dyn TransactionSigner>) {
        self.signers.insert(organization_id.into(), signer);
    }
}

#[async_trait]
impl WalletDirectory for StaticWalletDirectory {
    async fn signer_for(
        &self,
        organization_id: &str,
    ) -> CoordinatorResult<Option<Arc<dyn TransactionSigner>>> {
        Ok(self.signers.get(organization_id).map(|s| s.value().clone()))
    }
}
