//! # Bridge Routing
//!
//! The engine never speaks a bridge protocol itself. A host plugs in a
//! [`BridgeTransport`] that lists available routes and ships envelopes,
//! and a [`RouteScorer`] that decides which route is safe enough to use.
//!
//! The default [`ReputationScorer`] rates risk on a 0-100 scale:
//!
//! | provider   | base |
//! |------------|------|
//! | native     | 20   |
//! | LayerZero  | 30   |
//! | Wormhole   | 40   |
//! | Axelar     | 40   |
//! | Celer      | 50   |
//! | Multichain | 70   |
//! | other      | 90   |
//!
//! adjusted ×0.7 when the bridge secures more than $1B, ×1.5 when it
//! secures less than $10M, and +30 if it was ever exploited; capped at 100.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::message::CrossChainMessage;
use crate::types::ChainId;

/// Bridge TVL above which a route gets the security discount.
pub const HIGH_TVL_USD: u64 = 1_000_000_000;
/// Bridge TVL below which a route gets the risk penalty.
pub const LOW_TVL_USD: u64 = 10_000_000;

pub const MAX_RISK: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeProvider {
    Native,
    LayerZero,
    Wormhole,
    Axelar,
    Celer,
    Multichain,
    Other(String),
}

impl fmt::Display for BridgeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeProvider::Native => f.write_str("native"),
            BridgeProvider::LayerZero => f.write_str("layerzero"),
            BridgeProvider::Wormhole => f.write_str("wormhole"),
            BridgeProvider::Axelar => f.write_str("axelar"),
            BridgeProvider::Celer => f.write_str("celer"),
            BridgeProvider::Multichain => f.write_str("multichain"),
            BridgeProvider::Other(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRoute {
    pub provider: BridgeProvider,
    pub source: ChainId,
    pub destination: ChainId,
    /// Fee in the vault asset's smallest unit.
    pub fee: u64,
    pub estimated_secs: u64,
    pub tvl_usd: u64,
    pub previously_exploited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("bridge rejected message: {0}")]
    Rejected(String),

    #[error("bridge unavailable")]
    Unavailable,
}

/// Outbound message transport.
pub trait BridgeTransport: Send + Sync {
    /// Routes currently offered toward `destination`.
    fn routes(&self, destination: ChainId) -> Vec<BridgeRoute>;

    /// Hands the envelope to the bridge. Delivery is at-least-once.
    fn send(&self, route: &BridgeRoute, message: &CrossChainMessage) -> Result<(), TransportError>;
}

pub trait RouteScorer: Send + Sync {
    /// Risk of a route, 0 (safest) to 100.
    fn risk(&self, route: &BridgeRoute) -> u32;

    /// Lowest-risk route at or below `max_risk`; ties broken by fee, then
    /// estimated latency.
    fn select(&self, routes: &[BridgeRoute], max_risk: u32) -> Option<BridgeRoute> {
        routes
            .iter()
            .map(|r| (self.risk(r), r))
            .filter(|(risk, _)| *risk <= max_risk)
            .min_by_key(|(risk, r)| (*risk, r.fee, r.estimated_secs))
            .map(|(_, r)| r.clone())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReputationScorer;

impl ReputationScorer {
    fn base(provider: &BridgeProvider) -> u32 {
        match provider {
            BridgeProvider::Native => 20,
            BridgeProvider::LayerZero => 30,
            BridgeProvider::Wormhole | BridgeProvider::Axelar => 40,
            BridgeProvider::Celer => 50,
            BridgeProvider::Multichain => 70,
            BridgeProvider::Other(_) => 90,
        }
    }
}

impl RouteScorer for ReputationScorer {
    fn risk(&self, route: &BridgeRoute) -> u32 {
        let mut risk = Self::base(&route.provider);
        if route.tvl_usd > HIGH_TVL_USD {
            risk = risk * 7 / 10;
        } else if route.tvl_usd < LOW_TVL_USD {
            risk = (risk * 3 / 2).min(MAX_RISK);
        }
        if route.previously_exploited {
            risk = (risk + 30).min(MAX_RISK);
        }
        risk
    }
}
