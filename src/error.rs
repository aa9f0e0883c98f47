//! Error types for the transaction coordinator

use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Context resolution error: {0}")]
    ContextResolution(String),

    #[error("Failed to acquire nonce lock for {wallet} on chain {chain_id} after {attempts} attempts")]
    LockAcquisition {
        wallet: String,
        chain_id: u64,
        attempts: u32,
    },

    #[error("RPC error from {url}: {message}")]
    Rpc { url: String, message: String },

    #[error("RPC call rejected by {url} (code {code}): {message}")]
    RpcRejected {
        url: String,
        code: i64,
        message: String,
    },

    #[error("All RPC endpoints failed. Primary ({primary_url}): {primary_error}; fallback: {}",
        fallback_summary(.fallback_url, .fallback_error))]
    AllEndpointsFailed {
        primary_url: String,
        primary_error: String,
        fallback_url: Option<String>,
        fallback_error: Option<String>,
    },

    #[error("Gas pricing error: {0}")]
    GasPricing(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transaction {tx_hash} reverted on chain {chain_id}")]
    Reverted { chain_id: u64, tx_hash: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

fn fallback_summary(url: &Option<String>, error: &Option<String>) -> String {
    match (url, error) {
        (Some(url), Some(error)) => format!("({}): {}", url, error),
        (Some(url), None) => format!("({}): not attempted", url),
        _ => "not configured".to_string(),
    }
}

impl CoordinatorError {
    /// Check if error is a transport failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Rpc { .. } | CoordinatorError::Timeout { .. }
        )
    }

    /// The node already holds these exact signed bytes
    pub fn is_known_transaction(&self) -> bool {
        self.rejection_contains(&["already known", "known transaction", "already imported"])
    }

    /// The node has moved past this nonce
    pub fn is_nonce_too_low(&self) -> bool {
        self.rejection_contains(&["nonce too low"])
    }

    fn rejection_contains(&self, needles: &[&str]) -> bool {
        match self {
            CoordinatorError::RpcRejected { message, .. } => {
                let message = message.to_lowercase();
                needles.iter().any(|needle| message.contains(needle))
            }
            _ => false,
        }
    }

    /// Stable identifier embedded in step output
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::Config(_) => "config",
            CoordinatorError::Database(_) => "database",
            CoordinatorError::Validation(_) => "validation",
            CoordinatorError::ContextResolution(_) => "context_resolution",
            CoordinatorError::LockAcquisition { .. } => "lock_acquisition",
            CoordinatorError::Rpc { .. } => "rpc",
            CoordinatorError::RpcRejected { .. } => "rpc_rejected",
            CoordinatorError::AllEndpointsFailed { .. } => "all_endpoints_failed",
            CoordinatorError::GasPricing(_) => "gas_pricing",
            CoordinatorError::Signer(_) => "signer",
            CoordinatorError::Timeout { .. } => "timeout",
            CoordinatorError::Reverted { .. } => "reverted",
            CoordinatorError::Internal(_) => "internal",
        }
    }

    /// Errors caused by the system rather than the caller's input
    pub fn is_system_error(&self) -> bool {
        !matches!(self, CoordinatorError::Validation(_))
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregated_error_mentions_both_endpoints() {
        let err = CoordinatorError::AllEndpointsFailed {
            primary_url: "http://primary".to_string(),
            primary_error: "connection refused".to_string(),
            fallback_url: Some("http://fallback".to_string()),
            fallback_error: Some("503".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("http://primary"));
        assert!(msg.contains("connection refused"));
        assert!(msg.contains("http://fallback"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn test_lock_error_message() {
        let err = CoordinatorError::LockAcquisition {
            wallet: "0xabc".to_string(),
            chain_id: 1,
            attempts: 3,
        };
        assert!(err.to_string().contains("Failed to acquire nonce lock"));
        assert_eq!(err.kind(), "lock_acquisition");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rebroadcast_rejections() {
        let rejected = |message: &str| CoordinatorError::RpcRejected {
            url: "http://node".to_string(),
            code: -32000,
            message: message.to_string(),
        };

        assert!(rejected("already known").is_known_transaction());
        assert!(rejected("Known transaction: 0xabc").is_known_transaction());
        assert!(rejected("nonce too low: next nonce 5, tx nonce 4").is_nonce_too_low());
        assert!(!rejected("insufficient funds").is_known_transaction());

        let transport = CoordinatorError::Rpc {
            url: "http://node".to_string(),
            message: "already known".to_string(),
        };
        assert!(!transport.is_known_transaction());
    }
}
