//! # Strategy Allocator
//!
//! Owns the strategy slot table of one vault. Slots are keyed by a stable
//! [`StrategyId`] that is never reused, and iterated in id order so every
//! multi-strategy operation is deterministic.
//!
//! The allocator enforces three bounds on every mutation:
//!
//! ```text
//! asset(strategy) == asset(vault)
//! Σ allocation_bps(active slots) <= 10_000
//! slot count <= max_slots
//! ```
//!
//! Removal never blocks on a broken strategy. If the emergency withdrawal
//! fails, the slot is cleared anyway and its last known value is written
//! off into the bad-debt ledger, where it stays until recovered.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{guarded_call, SlotRecord, Strategy, StrategyError, StrategyId, StrategySlot};
use crate::config::MAX_BPS;
use crate::types::AssetId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    #[error("strategy asset {actual} does not match vault asset {expected}")]
    AssetMismatch { expected: AssetId, actual: AssetId },

    #[error("allocation ceiling exceeded: {current} bps allocated, {requested} bps requested, max {MAX_BPS}")]
    AllocationExceeded { current: u64, requested: u64 },

    #[error("strategy slot limit of {0} reached")]
    SlotLimit(usize),

    #[error("unknown strategy {0}")]
    UnknownStrategy(StrategyId),

    #[error("allocation of {0} bps is out of range")]
    InvalidAllocation(u64),

    #[error("max loss of {0} bps is out of range")]
    InvalidMaxLoss(u64),

    #[error("no bad debt recorded for {0}")]
    NoBadDebt(StrategyId),

    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

// ---------------------------------------------------------------------------
// Audit records
// ---------------------------------------------------------------------------

/// One entry of the allocation audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationChange {
    pub strategy: StrategyId,
    pub from_bps: u64,
    pub to_bps: u64,
    pub at: u64,
}

/// Funds written off when a strategy could not be unwound on removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadDebt {
    pub strategy: StrategyId,
    pub name: String,
    /// Outstanding unrecovered amount.
    pub amount: u64,
    /// Amount recovered since the write-off.
    pub recovered: u64,
    pub at: u64,
}

/// Outcome of [`StrategyAllocator::remove`].
#[derive(Debug, Clone)]
pub struct Removal {
    pub record: SlotRecord,
    /// Assets returned to the vault by the emergency withdrawal.
    pub recovered: u64,
    /// Set when the emergency withdrawal failed.
    pub bad_debt: Option<BadDebt>,
}

// ---------------------------------------------------------------------------
// StrategyAllocator
// ---------------------------------------------------------------------------

pub struct StrategyAllocator {
    asset: AssetId,
    max_slots: usize,
    slots: BTreeMap<StrategyId, StrategySlot>,
    next_id: u32,
    history: Vec<AllocationChange>,
    bad_debt: BTreeMap<StrategyId, BadDebt>,
    /// Handles of removed strategies that still owe the vault funds.
    written_off: BTreeMap<StrategyId, Arc<dyn Strategy>>,
}

impl std::fmt::Debug for StrategyAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyAllocator")
            .field("asset", &self.asset)
            .field("slots", &self.slots)
            .field("bad_debt", &self.bad_debt)
            .finish_non_exhaustive()
    }
}

impl StrategyAllocator {
    pub fn new(asset: AssetId, max_slots: usize) -> Self {
        Self {
            asset,
            max_slots,
            slots: BTreeMap::new(),
            next_id: 1,
            history: Vec::new(),
            bad_debt: BTreeMap::new(),
            written_off: BTreeMap::new(),
        }
    }

    /// Rebuilds an allocator from persisted parts. Slots whose handle could
    /// not be resolved are dropped by the caller before this point.
    pub fn from_parts(
        asset: AssetId,
        max_slots: usize,
        slots: Vec<StrategySlot>,
        next_id: u32,
        history: Vec<AllocationChange>,
        bad_debt: Vec<(BadDebt, Option<Arc<dyn Strategy>>)>,
    ) -> Self {
        let mut allocator = Self::new(asset, max_slots);
        allocator.next_id = next_id.max(1);
        allocator.history = history;
        for slot in slots {
            allocator.next_id = allocator.next_id.max(slot.id().0 + 1);
            allocator.slots.insert(slot.id(), slot);
        }
        for (entry, handle) in bad_debt {
            if let Some(handle) = handle {
                allocator.written_off.insert(entry.strategy, handle);
            }
            allocator.bad_debt.insert(entry.strategy, entry);
        }
        allocator
    }

    // -- Queries -------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn get(&self, id: StrategyId) -> Result<&StrategySlot, AllocatorError> {
        self.slots.get(&id).ok_or(AllocatorError::UnknownStrategy(id))
    }

    pub fn get_mut(&mut self, id: StrategyId) -> Result<&mut StrategySlot, AllocatorError> {
        self.slots
            .get_mut(&id)
            .ok_or(AllocatorError::UnknownStrategy(id))
    }

    pub fn ids(&self) -> Vec<StrategyId> {
        self.slots.keys().copied().collect()
    }

    pub fn active_ids(&self) -> Vec<StrategyId> {
        self.slots
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.id())
            .collect()
    }

    pub fn slots(&self) -> impl Iterator<Item = &StrategySlot> {
        self.slots.values()
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut StrategySlot> {
        self.slots.values_mut()
    }

    pub fn records(&self) -> Vec<SlotRecord> {
        self.slots.values().map(|s| s.record.clone()).collect()
    }

    /// `Σ allocation_bps` over active slots.
    pub fn total_allocation(&self) -> u64 {
        self.slots
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.record.allocation_bps)
            .sum()
    }

    pub fn history(&self) -> &[AllocationChange] {
        &self.history
    }

    pub fn bad_debt(&self) -> Vec<BadDebt> {
        self.bad_debt.values().cloned().collect()
    }

    /// Outstanding unrecovered amount across all write-offs.
    pub fn total_bad_debt(&self) -> u64 {
        self.bad_debt
            .values()
            .fold(0u64, |acc, d| acc.saturating_add(d.amount))
    }

    /// Sum of every slot's value, using last known values for failing
    /// strategies.
    pub fn invested_assets(&mut self) -> u64 {
        self.slots
            .values_mut()
            .fold(0u64, |acc, s| acc.saturating_add(s.assets_or_last_known()))
    }

    // -- Mutations -----------------------------------------------------------

    /// Registers a strategy and returns its id.
    pub fn add(
        &mut self,
        handle: Arc<dyn Strategy>,
        allocation_bps: u64,
        max_loss_bps: u64,
        now: u64,
    ) -> Result<StrategyId, AllocatorError> {
        let actual = handle.asset();
        if actual != self.asset {
            return Err(AllocatorError::AssetMismatch {
                expected: self.asset.clone(),
                actual,
            });
        }
        if allocation_bps > MAX_BPS {
            return Err(AllocatorError::InvalidAllocation(allocation_bps));
        }
        if max_loss_bps > MAX_BPS {
            return Err(AllocatorError::InvalidMaxLoss(max_loss_bps));
        }
        if self.slots.len() >= self.max_slots {
            return Err(AllocatorError::SlotLimit(self.max_slots));
        }
        self.check_ceiling(None, allocation_bps)?;

        let id = StrategyId(self.next_id);
        self.next_id += 1;
        let name = {
            let h = Arc::clone(&handle);
            guarded_call("name", || Ok(h.name())).unwrap_or_else(|_| id.to_string())
        };

        let record = SlotRecord {
            id,
            name,
            allocation_bps,
            active: true,
            max_loss_bps,
            total_deposited: 0,
            total_withdrawn: 0,
            realized_loss: 0,
            total_harvested: 0,
            last_reported_assets: 0,
            last_harvest: None,
            added_at: now,
            allocation_updated_at: now,
        };
        tracing::info!(strategy = %id, name = %record.name, allocation_bps, max_loss_bps, "strategy added");
        self.slots.insert(id, StrategySlot::new(record, handle));
        self.history.push(AllocationChange {
            strategy: id,
            from_bps: 0,
            to_bps: allocation_bps,
            at: now,
        });
        Ok(id)
    }

    /// Changes a slot's target allocation. Same ceiling as [`Self::add`].
    pub fn update_allocation(
        &mut self,
        id: StrategyId,
        allocation_bps: u64,
        now: u64,
    ) -> Result<AllocationChange, AllocatorError> {
        if allocation_bps > MAX_BPS {
            return Err(AllocatorError::InvalidAllocation(allocation_bps));
        }
        let active = self.get(id)?.is_active();
        if active {
            self.check_ceiling(Some(id), allocation_bps)?;
        }

        let slot = self.get_mut(id)?;
        let change = AllocationChange {
            strategy: id,
            from_bps: slot.record.allocation_bps,
            to_bps: allocation_bps,
            at: now,
        };
        slot.record.allocation_bps = allocation_bps;
        slot.record.allocation_updated_at = now;
        self.history.push(change.clone());
        tracing::info!(strategy = %id, from = change.from_bps, to = allocation_bps, "allocation updated");
        Ok(change)
    }

    /// Activates or deactivates a slot. Reactivation re-checks the ceiling.
    pub fn set_active(&mut self, id: StrategyId, active: bool) -> Result<(), AllocatorError> {
        let slot = self.get(id)?;
        if slot.is_active() == active {
            return Ok(());
        }
        if active {
            let bps = slot.record.allocation_bps;
            self.check_ceiling(Some(id), bps)?;
        }
        self.get_mut(id)?.record.active = active;
        tracing::info!(strategy = %id, active, "strategy activation changed");
        Ok(())
    }

    /// Unwinds and removes a slot.
    ///
    /// The emergency withdrawal is attempted first; on failure the slot is
    /// still removed and its last known value becomes bad debt.
    pub fn remove(&mut self, id: StrategyId, now: u64) -> Result<Removal, AllocatorError> {
        let mut slot = self
            .slots
            .remove(&id)
            .ok_or(AllocatorError::UnknownStrategy(id))?;
        let expected = slot.assets_or_last_known();

        let (recovered, bad_debt) = match slot.emergency_withdraw() {
            Ok(recovered) => {
                if recovered < expected {
                    tracing::warn!(strategy = %id, expected, recovered, "strategy removed at a loss");
                }
                (recovered, None)
            }
            Err(e) => {
                tracing::error!(
                    strategy = %id,
                    error = %e,
                    written_off = expected,
                    "emergency withdrawal failed on removal, recording bad debt"
                );
                let entry = BadDebt {
                    strategy: id,
                    name: slot.record.name.clone(),
                    amount: expected,
                    recovered: 0,
                    at: now,
                };
                if expected > 0 {
                    self.bad_debt.insert(id, entry.clone());
                    self.written_off.insert(id, Arc::clone(slot.handle()));
                }
                (0, Some(entry))
            }
        };

        if slot.record.allocation_bps > 0 {
            self.history.push(AllocationChange {
                strategy: id,
                from_bps: slot.record.allocation_bps,
                to_bps: 0,
                at: now,
            });
        }
        tracing::info!(strategy = %id, recovered, "strategy removed");
        Ok(Removal {
            record: slot.record,
            recovered,
            bad_debt,
        })
    }

    /// Retries the emergency withdrawal of a written-off strategy. Returns
    /// the amount recovered, which the caller credits to idle cash.
    pub fn recover_bad_debt(&mut self, id: StrategyId) -> Result<u64, AllocatorError> {
        let handle = self
            .written_off
            .get(&id)
            .cloned()
            .ok_or(AllocatorError::NoBadDebt(id))?;
        let entry = self
            .bad_debt
            .get_mut(&id)
            .ok_or(AllocatorError::NoBadDebt(id))?;

        let recovered = guarded_call("emergency_withdraw", || handle.emergency_withdraw())?;
        entry.amount = entry.amount.saturating_sub(recovered);
        entry.recovered = entry.recovered.saturating_add(recovered);
        tracing::info!(strategy = %id, recovered, outstanding = entry.amount, "bad debt recovery");

        if entry.amount == 0 {
            self.bad_debt.remove(&id);
            self.written_off.remove(&id);
        }
        Ok(recovered)
    }

    fn check_ceiling(&self, replacing: Option<StrategyId>, requested: u64) -> Result<(), AllocatorError> {
        let current: u64 = self
            .slots
            .values()
            .filter(|s| s.is_active() && Some(s.id()) != replacing)
            .map(|s| s.record.allocation_bps)
            .sum();
        if current + requested > MAX_BPS {
            return Err(AllocatorError::AllocationExceeded { current, requested });
        }
        Ok(())
    }
}
