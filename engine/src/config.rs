//! # Engine Configuration & Constants
//!
//! Every accounting constant the engine relies on lives here, next to the
//! per-vault [`VaultConfig`]. Changing a constant changes the economics of
//! every vault that was created with it, so treat this file as part of the
//! accounting surface, not as tuning knobs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AssetId, ChainId};

// ---------------------------------------------------------------------------
// Basis Points
// ---------------------------------------------------------------------------

/// 100% expressed in basis points.
pub const MAX_BPS: u64 = 10_000;

/// Seconds in a (non-leap) year, the denominator of the management fee.
pub const SECONDS_PER_YEAR: u64 = 365 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Allocation & Rebalancing
// ---------------------------------------------------------------------------

/// Hard cap on registered strategy slots. Every rebalance, harvest and
/// liquidity pull iterates all slots, so this bounds the cost of each call.
pub const MAX_STRATEGIES: usize = 20;

/// A deposit larger than this share of total assets triggers incremental
/// deployment of idle cash (500 bps = 5%).
pub const LARGE_DEPOSIT_THRESHOLD_BPS: u64 = 500;

/// Upper bound on idle cash deployed by one deposit-triggered deployment
/// (2_500 bps = 25% of idle).
pub const INCREMENTAL_DEPLOY_BPS: u64 = 2_500;

/// Default minimum spacing between two full rebalances.
pub const DEFAULT_MIN_REBALANCE_INTERVAL_SECS: u64 = 60 * 60;

/// Default tolerance for liquidity shortfall on withdrawal (1%).
pub const DEFAULT_MAX_SLIPPAGE_BPS: u64 = 100;

/// Default per-strategy loss tolerance on withdrawal (0.5%).
pub const DEFAULT_STRATEGY_MAX_LOSS_BPS: u64 = 50;

/// Largest decimals offset accepted. `10^offset` is added to the share
/// supply in every conversion; beyond 9 the `u128` intermediates of large
/// balances start to overflow.
pub const MAX_DECIMALS_OFFSET: u8 = 9;

// ---------------------------------------------------------------------------
// Fees
// ---------------------------------------------------------------------------

/// Highest management fee a vault may be configured with (10% per year).
pub const MAX_MANAGEMENT_FEE_BPS: u64 = 1_000;

/// Highest performance fee a vault may be configured with (50% of harvest).
pub const MAX_PERFORMANCE_FEE_BPS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Cross-Chain
// ---------------------------------------------------------------------------

/// Domain tag mixed into every cross-chain nonce so that digests can never
/// collide with hashes computed for other purposes.
pub const NONCE_DOMAIN_TAG: &[u8] = b"meridian/xchain-nonce/v1";

/// Routes scoring above this risk value (0-100) are never used.
pub const DEFAULT_MAX_ROUTE_RISK: u32 = 70;

// ---------------------------------------------------------------------------
// VaultConfig
// ---------------------------------------------------------------------------

/// Rejected vault configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} is {value} bps, above the maximum of {max}")]
    BpsOutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("decimals offset {0} exceeds maximum of {MAX_DECIMALS_OFFSET}")]
    DecimalsOffset(u8),

    #[error("max_strategies must be between 1 and {MAX_STRATEGIES}, got {0}")]
    StrategyCap(usize),

    #[error("min_deposit {min} exceeds deposit_limit {limit}")]
    DepositBounds { min: u64, limit: u64 },
}

/// Per-vault parameters, fixed at creation except where an admin entry
/// point says otherwise (fees, fee recipient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Underlying asset the vault accounts in.
    pub asset: AssetId,
    /// Chain this vault instance lives on.
    pub chain: ChainId,
    /// Exponent of the virtual share offset in the exchange rate.
    pub decimals_offset: u8,
    /// Maximum tolerated liquidity shortfall on withdrawal.
    pub max_slippage_bps: u64,
    /// Annualised management fee.
    pub management_fee_bps: u64,
    /// Fee on realized harvest proceeds.
    pub performance_fee_bps: u64,
    /// Ceiling on total assets accepted through deposits.
    pub deposit_limit: u64,
    /// Smallest accepted deposit.
    pub min_deposit: u64,
    /// Minimum spacing between full rebalances.
    pub min_rebalance_interval_secs: u64,
    /// Strategy slot cap, at most [`MAX_STRATEGIES`].
    pub max_strategies: usize,
    /// Highest acceptable bridge route risk score.
    pub max_route_risk: u32,
}

impl VaultConfig {
    /// A config with library defaults for the given asset and chain.
    pub fn new(asset: AssetId, chain: ChainId) -> Self {
        Self {
            asset,
            chain,
            decimals_offset: 0,
            max_slippage_bps: DEFAULT_MAX_SLIPPAGE_BPS,
            management_fee_bps: 200,
            performance_fee_bps: 1_000,
            deposit_limit: u64::MAX,
            min_deposit: 1,
            min_rebalance_interval_secs: DEFAULT_MIN_REBALANCE_INTERVAL_SECS,
            max_strategies: MAX_STRATEGIES,
            max_route_risk: DEFAULT_MAX_ROUTE_RISK,
        }
    }

    /// Checks every bound. Called by the vault constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bps("max_slippage_bps", self.max_slippage_bps, MAX_BPS)?;
        check_bps(
            "management_fee_bps",
            self.management_fee_bps,
            MAX_MANAGEMENT_FEE_BPS,
        )?;
        check_bps(
            "performance_fee_bps",
            self.performance_fee_bps,
            MAX_PERFORMANCE_FEE_BPS,
        )?;
        if self.decimals_offset > MAX_DECIMALS_OFFSET {
            return Err(ConfigError::DecimalsOffset(self.decimals_offset));
        }
        if self.max_strategies == 0 || self.max_strategies > MAX_STRATEGIES {
            return Err(ConfigError::StrategyCap(self.max_strategies));
        }
        if self.min_deposit > self.deposit_limit {
            return Err(ConfigError::DepositBounds {
                min: self.min_deposit,
                limit: self.deposit_limit,
            });
        }
        Ok(())
    }

    /// `10^decimals_offset`, the virtual supply added in conversions.
    pub fn virtual_shares(&self) -> u128 {
        10u128.pow(self.decimals_offset as u32)
    }
}

fn check_bps(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::BpsOutOfRange { field, value, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VaultConfig {
        VaultConfig::new(AssetId::new("USDC"), ChainId(1))
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(config().validate(), Ok(()));
    }

    #[test]
    fn threshold_constants_sanity() {
        assert!(LARGE_DEPOSIT_THRESHOLD_BPS < MAX_BPS);
        assert!(INCREMENTAL_DEPLOY_BPS < MAX_BPS);
        assert!(MAX_MANAGEMENT_FEE_BPS < MAX_PERFORMANCE_FEE_BPS);
        assert_eq!(SECONDS_PER_YEAR, 31_536_000);
    }

    #[test]
    fn rejects_out_of_range_fees() {
        let mut cfg = config();
        cfg.management_fee_bps = MAX_MANAGEMENT_FEE_BPS + 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BpsOutOfRange {
                field: "management_fee_bps",
                ..
            })
        ));
    }

    #[test]
    fn rejects_large_decimals_offset() {
        let mut cfg = config();
        cfg.decimals_offset = MAX_DECIMALS_OFFSET + 1;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::DecimalsOffset(MAX_DECIMALS_OFFSET + 1))
        );
    }

    #[test]
    fn rejects_inverted_deposit_bounds() {
        let mut cfg = config();
        cfg.deposit_limit = 10;
        cfg.min_deposit = 11;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DepositBounds { .. })
        ));
    }

    #[test]
    fn virtual_shares_scale() {
        let mut cfg = config();
        assert_eq!(cfg.virtual_shares(), 1);
        cfg.decimals_offset = 6;
        assert_eq!(cfg.virtual_shares(), 1_000_000);
    }

    #[test]
    fn config_json_roundtrip() {
        let cfg = config();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: VaultConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
