//! Serializable vault state.
//!
//! A snapshot holds everything except live strategy handles and the
//! message ledgers. Handles are re-attached through a resolver on restore;
//! message records live in their own store trees and are loaded next to
//! the snapshot.

use serde::{Deserialize, Serialize};

use crate::access::AccessControl;
use crate::config::VaultConfig;
use crate::crosschain::RemoteView;
use crate::emergency::EmergencyState;
use crate::fees::FeeState;
use crate::ledger::ShareLedger;
use crate::strategy::{AllocationChange, BadDebt, SlotRecord};
use crate::types::{Address, ChainId};

/// Format version written into every snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Lifetime asset flows, in assets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flows {
    pub deposited: u64,
    pub withdrawn: u64,
    pub bridged_in: u64,
    pub bridged_out: u64,
    pub harvested: u64,
    pub written_off: u64,
    pub recovered: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub version: u32,
    pub taken_at: u64,
    pub address: Address,
    pub config: VaultConfig,
    pub access: AccessControl,
    pub ledger: ShareLedger,
    pub idle: u64,
    pub fees: FeeState,
    pub emergency: EmergencyState,
    pub shutdown_at: Option<u64>,
    pub last_rebalance_at: Option<u64>,
    pub slots: Vec<SlotRecord>,
    pub next_strategy_id: u32,
    pub allocation_history: Vec<AllocationChange>,
    pub bad_debt: Vec<BadDebt>,
    pub trusted_chains: Vec<(ChainId, Address)>,
    pub remote_views: Vec<(ChainId, RemoteView)>,
    pub inbound_duplicates: u64,
    pub flows: Flows,
}

impl VaultSnapshot {
    /// Total assets as last reported: idle plus every slot's last value.
    pub fn reported_total_assets(&self) -> u64 {
        self.slots
            .iter()
            .fold(self.idle, |acc, s| acc.saturating_add(s.last_reported_assets))
    }
}
