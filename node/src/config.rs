//! Node configuration file.
//!
//! A JSON document describing the one vault this node hosts: its
//! [`VaultConfig`], who administers it, which remote chains it trusts and
//! which simulated strategies back it. Loaded at `run`, written by `init`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use meridian_engine::access::Role;
use meridian_engine::config::VaultConfig;
use meridian_engine::types::{Address, AssetId, ChainId};
use meridian_sim::StrategyProfile;

pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub account: Address,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedChain {
    pub chain: ChainId,
    pub vault: Address,
}

/// A simulated strategy and the slot it occupies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyEntry {
    #[serde(flatten)]
    pub profile: StrategyProfile,
    pub allocation_bps: u64,
    #[serde(default = "default_max_loss_bps")]
    pub max_loss_bps: u64,
}

fn default_max_loss_bps() -> u64 {
    50
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub vault: VaultConfig,
    /// Holds `Admin` from creation on.
    pub admin: Address,
    /// Address remote vaults know this one by.
    #[serde(default)]
    pub vault_address: Option<Address>,
    #[serde(default)]
    pub fee_recipient: Option<Address>,
    #[serde(default)]
    pub roles: Vec<RoleGrant>,
    #[serde(default)]
    pub trusted_chains: Vec<TrustedChain>,
    #[serde(default)]
    pub strategies: Vec<StrategyEntry>,
}

impl NodeConfig {
    /// A single-chain USDC vault with two simulated strategies.
    pub fn devnet() -> Result<Self> {
        let admin = Address::parse("admin").context("default admin address")?;
        let lending = StrategyProfile::new("lending", 450);
        let mut staking = StrategyProfile::new("staking", 700);
        staking.liquidity_bps = 5_000;
        Ok(Self {
            vault: VaultConfig::new(AssetId::new("USDC"), ChainId(1)),
            fee_recipient: Some(Address::parse("treasury").context("default fee recipient")?),
            roles: vec![RoleGrant {
                account: Address::parse("relayer").context("default relayer")?,
                role: Role::Relayer,
            }],
            admin,
            vault_address: None,
            trusted_chains: Vec::new(),
            strategies: vec![
                StrategyEntry {
                    profile: lending,
                    allocation_bps: 6_000,
                    max_loss_bps: 50,
                },
                StrategyEntry {
                    profile: staking,
                    allocation_bps: 3_000,
                    max_loss_bps: 100,
                },
            ],
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("failed to write config {}", path.display()))
    }

    /// Checks what the vault constructor cannot: strategy names are unique
    /// and the allocations fit.
    pub fn validate(&self) -> Result<()> {
        self.vault.validate().context("invalid vault config")?;
        let mut names: Vec<&str> = self.strategies.iter().map(|s| s.profile.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("strategy name {:?} appears more than once", pair[0]);
        }
        let allocated: u64 = self.strategies.iter().map(|s| s.allocation_bps).sum();
        if allocated > meridian_engine::config::MAX_BPS {
            anyhow::bail!("strategy allocations sum to {allocated} bps");
        }
        Ok(())
    }

    pub fn strategy(&self, name: &str) -> Option<&StrategyEntry> {
        self.strategies.iter().find(|s| s.profile.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devnet_config_survives_a_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = NodeConfig::devnet().unwrap();
        config.write(&path).unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn minimal_document_fills_defaults() {
        let raw = r#"{
            "vault": {
                "asset": "DAI", "chain": 10, "decimals_offset": 3,
                "max_slippage_bps": 100, "management_fee_bps": 0,
                "performance_fee_bps": 500, "deposit_limit": 1000000000,
                "min_deposit": 1, "min_rebalance_interval_secs": 60,
                "max_strategies": 4, "max_route_risk": 70
            },
            "admin": "ops",
            "strategies": [{ "name": "aave", "apy_bps": 300, "allocation_bps": 5000 }]
        }"#;
        let config: NodeConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        let aave = config.strategy("aave").unwrap();
        assert_eq!(aave.max_loss_bps, 50);
        assert_eq!(aave.profile.liquidity_bps, 10_000);
        assert!(config.roles.is_empty());
    }

    #[test]
    fn duplicate_names_and_overallocation_are_rejected() {
        let mut config = NodeConfig::devnet().unwrap();
        config.strategies[1].profile.name = "lending".into();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::devnet().unwrap();
        config.strategies[1].allocation_bps = 5_000;
        assert!(config.validate().is_err());
    }
}
