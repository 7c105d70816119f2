//! Per-strategy bookkeeping.
//!
//! A [`StrategySlot`] pairs the live strategy handle with a serializable
//! [`SlotRecord`]. Only the record is persisted; the handle is re-attached
//! when a vault is restored from a snapshot.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{guarded_call, Strategy, StrategyError, StrategyId};

/// Serializable state of one registered strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub id: StrategyId,
    pub name: String,
    /// Target share of total assets, 0..=10_000 bps.
    pub allocation_bps: u64,
    /// Inactive slots keep their funds but receive no new capital and do
    /// not count toward the allocation ceiling.
    pub active: bool,
    /// Largest tolerated shortfall on a withdrawal from this strategy.
    pub max_loss_bps: u64,
    /// Cumulative assets invested into the strategy.
    pub total_deposited: u64,
    /// Cumulative assets returned by the strategy (withdrawals only).
    pub total_withdrawn: u64,
    /// Cumulative shortfall realized on withdrawals.
    pub realized_loss: u64,
    /// Cumulative harvest proceeds.
    pub total_harvested: u64,
    /// Last value reported by `total_assets()`; used when a call fails.
    pub last_reported_assets: u64,
    pub last_harvest: Option<u64>,
    pub added_at: u64,
    pub allocation_updated_at: u64,
}

/// A registered strategy: live handle plus bookkeeping.
#[derive(Clone)]
pub struct StrategySlot {
    pub record: SlotRecord,
    handle: Arc<dyn Strategy>,
}

impl fmt::Debug for StrategySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategySlot")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl StrategySlot {
    pub fn new(record: SlotRecord, handle: Arc<dyn Strategy>) -> Self {
        Self { record, handle }
    }

    pub fn id(&self) -> StrategyId {
        self.record.id
    }

    pub fn handle(&self) -> &Arc<dyn Strategy> {
        &self.handle
    }

    pub fn is_active(&self) -> bool {
        self.record.active
    }

    /// Queries the strategy's value, refreshing `last_reported_assets` on
    /// success. Failures are returned so callers can decide how to degrade.
    pub fn refresh_assets(&mut self) -> Result<u64, StrategyError> {
        let handle = Arc::clone(&self.handle);
        let value = guarded_call("total_assets", || handle.total_assets())?;
        self.record.last_reported_assets = value;
        Ok(value)
    }

    /// Current value, falling back to the last reported one on failure.
    pub fn assets_or_last_known(&mut self) -> u64 {
        match self.refresh_assets() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    strategy = %self.record.id,
                    error = %e,
                    fallback = self.record.last_reported_assets,
                    "total_assets failed, using last reported value"
                );
                self.record.last_reported_assets
            }
        }
    }

    /// Invests `amount`, validating the reported result.
    pub fn invest(&mut self, amount: u64) -> Result<u64, StrategyError> {
        if !self.handle.is_active() {
            return Err(StrategyError::Inactive);
        }
        let handle = Arc::clone(&self.handle);
        let invested = guarded_call("invest", || handle.invest(amount))?;
        if invested > amount {
            return Err(StrategyError::Misreported {
                op: "invest",
                requested: amount,
                reported: invested,
            });
        }
        self.record.total_deposited = self.record.total_deposited.saturating_add(invested);
        self.record.last_reported_assets = self.record.last_reported_assets.saturating_add(invested);
        Ok(invested)
    }

    /// Withdraws `amount`; returns what actually arrived. A strategy that
    /// claims to return more than was asked is not believed.
    pub fn withdraw(&mut self, amount: u64) -> Result<u64, StrategyError> {
        let handle = Arc::clone(&self.handle);
        let received = guarded_call("withdraw", || handle.withdraw(amount))?;
        if received > amount {
            return Err(StrategyError::Misreported {
                op: "withdraw",
                requested: amount,
                reported: received,
            });
        }
        self.record.total_withdrawn = self.record.total_withdrawn.saturating_add(received);
        self.record.last_reported_assets = self.record.last_reported_assets.saturating_sub(amount);
        if received < amount {
            self.record.realized_loss = self
                .record
                .realized_loss
                .saturating_add(amount - received);
        }
        Ok(received)
    }

    pub fn harvest(&mut self, now: u64) -> Result<u64, StrategyError> {
        let handle = Arc::clone(&self.handle);
        let harvested = guarded_call("harvest", || handle.harvest())?;
        self.record.total_harvested = self.record.total_harvested.saturating_add(harvested);
        self.record.last_harvest = Some(now);
        // the proceeds left the position whether or not it can be valued
        if let Err(e) = self.refresh_assets() {
            self.record.last_reported_assets = self.record.last_reported_assets.saturating_sub(harvested);
            tracing::warn!(
                strategy = %self.record.id,
                error = %e,
                harvested,
                fallback = self.record.last_reported_assets,
                "total_assets failed after harvest"
            );
        }
        Ok(harvested)
    }

    pub fn emergency_withdraw(&mut self) -> Result<u64, StrategyError> {
        let handle = Arc::clone(&self.handle);
        let recovered = guarded_call("emergency_withdraw", || handle.emergency_withdraw())?;
        self.record.total_withdrawn = self.record.total_withdrawn.saturating_add(recovered);
        self.record.last_reported_assets = 0;
        Ok(recovered)
    }

    pub fn apy_bps(&self) -> Option<u64> {
        let handle = Arc::clone(&self.handle);
        guarded_call("apy", || handle.apy_bps()).ok()
    }

    /// Whether a shortfall of `requested - received` breaches `max_loss_bps`.
    pub fn loss_exceeds_tolerance(&self, requested: u64, received: u64) -> bool {
        if received >= requested {
            return false;
        }
        let loss = (requested - received) as u128;
        loss * crate::config::MAX_BPS as u128 > requested as u128 * self.record.max_loss_bps as u128
    }
}
