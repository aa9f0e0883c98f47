//! Gas pricing for workflow-triggered transactions
//!
//! Unattended triggers pay a buffer to maximize inclusion; manual triggers
//! use the network's quote as-is unless fees are swinging away from the
//! chain's recent baseline.

use super::context::TriggerType;
use crate::chain::{ChainRpc, FeeData};
use crate::error::{CoordinatorError, CoordinatorResult};

use dashmap::DashMap;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasStrategyConfig {
    /// Extra fee percentage applied in conservative mode
    pub conservative_buffer_percent: u64,
    /// Deviation from the recent baseline that counts as volatile
    pub volatility_threshold_percent: u64,
}

impl Default for GasStrategyConfig {
    fn default() -> Self {
        Self {
            conservative_buffer_percent: 20,
            volatility_threshold_percent: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingStrategy {
    Conservative,
    Optimized,
}

/// Concrete gas parameters for one submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasConfig {
    pub gas_limit: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub strategy: PricingStrategy,
    pub volatility_warning: bool,
}

/// Per-chain padding defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainGasDefaults {
    /// Gas limit multiplier, in percent of the estimate
    pub gas_limit_percent: u64,
}

/// Get gas limit padding for a chain
pub fn chain_gas_defaults(chain_id: u64) -> ChainGasDefaults {
    let gas_limit_percent = match chain_id {
        // Ethereum mainnet and testnets
        1 | 11155111 | 17000 => 150,
        // Polygon (volatile estimates)
        137 | 80002 => 160,
        // Arbitrum
        42161 | 421614 => 130,
        // Optimism
        10 | 11155420 => 130,
        // Base
        8453 | 84532 => 130,
        // Default conservative
        _ => 150,
    };

    ChainGasDefaults { gas_limit_percent }
}

/// Computes gas configuration from live fee data
pub struct GasStrategy {
    config: GasStrategyConfig,
    /// Recent observed fee per chain (moving average, wei)
    baselines: DashMap<u64, U256>,
}

impl GasStrategy {
    pub fn new(config: GasStrategyConfig) -> Self {
        Self {
            config,
            baselines: DashMap::new(),
        }
    }

    /// Price a call with `estimated_gas` for the given trigger
    pub async fn get_gas_config(
        &self,
        provider: &dyn ChainRpc,
        trigger_type: TriggerType,
        estimated_gas: U256,
        chain_id: u64,
        multiplier_override: Option<f64>,
        gas_limit_override: Option<U256>,
    ) -> CoordinatorResult<GasConfig> {
        let fee_data = provider.get_fee_data().await?;

        let gas_limit = match gas_limit_override {
            Some(limit) => limit,
            None => {
                let percent = match multiplier_override {
                    Some(multiplier) => multiplier_percent(multiplier)?,
                    None => chain_gas_defaults(chain_id).gas_limit_percent,
                };
                apply_percent_ceil(estimated_gas, percent)
            }
        };

        let volatility_warning = self.observe(chain_id, &fee_data);
        let strategy = if volatility_warning || trigger_type.is_unattended() {
            PricingStrategy::Conservative
        } else {
            PricingStrategy::Optimized
        };

        let (max_fee, priority_fee) = quoted_fees(&fee_data)?;
        let fee_percent = match strategy {
            PricingStrategy::Conservative => 100 + self.config.conservative_buffer_percent,
            PricingStrategy::Optimized => 100,
        };

        let max_priority_fee_per_gas = apply_percent_ceil(priority_fee, fee_percent);
        let max_fee_per_gas =
            std::cmp::max(apply_percent_ceil(max_fee, fee_percent), max_priority_fee_per_gas);

        if volatility_warning {
            warn!(
                "Fee volatility on chain {}: forcing conservative pricing for {} trigger",
                chain_id,
                trigger_type.as_str()
            );
        }

        let gas_config = GasConfig {
            gas_limit,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            strategy,
            volatility_warning,
        };
        debug!("Gas config for chain {}: {:?}", chain_id, gas_config);
        Ok(gas_config)
    }

    /// Record an observation; true if it deviates from the prior baseline
    fn observe(&self, chain_id: u64, fee_data: &FeeData) -> bool {
        let Some(observed) = fee_data.base_fee_per_gas.or(fee_data.gas_price) else {
            return false;
        };

        let mut entry = self.baselines.entry(chain_id).or_insert(observed);
        let baseline = *entry;

        // Baseline follows the market with weight 1/5 per observation.
        *entry = (baseline * 4 + observed) / 5;

        if baseline.is_zero() {
            return false;
        }

        let deviation = if observed > baseline {
            observed - baseline
        } else {
            baseline - observed
        };
        deviation * 100 / baseline > U256::from(self.config.volatility_threshold_percent)
    }
}

impl Default for GasStrategy {
    fn default() -> Self {
        Self::new(GasStrategyConfig::default())
    }
}

fn quoted_fees(fee_data: &FeeData) -> CoordinatorResult<(U256, U256)> {
    match (
        fee_data.max_fee_per_gas,
        fee_data.max_priority_fee_per_gas,
        fee_data.gas_price,
    ) {
        (Some(max_fee), Some(priority_fee), _) => Ok((max_fee, priority_fee)),
        // Legacy chain: the gas price is both cap and tip
        (_, _, Some(gas_price)) => Ok((gas_price, gas_price)),
        _ => Err(CoordinatorError::GasPricing(
            "Provider returned no fee data".to_string(),
        )),
    }
}

fn multiplier_percent(multiplier: f64) -> CoordinatorResult<u64> {
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return Err(CoordinatorError::Validation(format!(
            "Invalid gas limit multiplier {}",
            multiplier
        )));
    }
    Ok((multiplier * 100.0).round() as u64)
}

fn apply_percent_ceil(value: U256, percent: u64) -> U256 {
    (value * percent + 99) / 100
}
