//! Configuration management for the transaction coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::FailoverConfig;
use crate::tx::{GasStrategyConfig, NonceConfig, SubmissionConfig};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "TX_COORDINATOR_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub rpc: FailoverConfig,
    #[serde(default)]
    pub gas: GasStrategyConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance_id: Option<String>,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Known RPC endpoint pair for a chain, probed by the health loop
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub fallback_rpc_url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Load settings from the file named by `TX_COORDINATOR_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL must be set");
        }

        if self.nonce.max_lock_retries == 0 {
            anyhow::bail!("nonce.max_lock_retries must be at least 1");
        }

        if self.rpc.max_retries == 0 {
            anyhow::bail!("rpc.max_retries must be at least 1");
        }

        if self.submission.inclusion_timeout_secs == 0 {
            anyhow::bail!("submission.inclusion_timeout_secs must be positive");
        }

        // A live session must never look stale to a contender.
        let session_budget_ms = self
            .submission
            .inclusion_timeout_secs
            .saturating_mul(1_000)
            .saturating_add(self.rpc.call_budget_ms());
        if self.nonce.lock_timeout_ms <= session_budget_ms {
            anyhow::bail!(
                "nonce.lock_timeout_ms ({}) must exceed the inclusion timeout plus the RPC retry budget ({} ms)",
                self.nonce.lock_timeout_ms,
                session_budget_ms
            );
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_url.is_empty() {
                anyhow::bail!("Chain {} has no RPC URL configured", name);
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
