//! Mutable state of one vault and the steps its entry points share.
//!
//! Everything in here runs inside the vault's critical section. Nothing
//! in this module checks roles or emergency gates; the entry points in
//! `user.rs`, `admin.rs` and `settlement.rs` do that before calling in.

use std::collections::BTreeSet;

use crate::access::{AccessControl, Capability};
use crate::config::{VaultConfig, INCREMENTAL_DEPLOY_BPS, LARGE_DEPOSIT_THRESHOLD_BPS, MAX_BPS};
use crate::crosschain::{CrossChainSettlement, InboundRecord, Nonce, OutboundRecord};
use crate::emergency::EmergencyController;
use crate::error::{VaultError, VaultResult};
use crate::events::{EventLog, VaultEvent};
use crate::fees::FeeAccrual;
use crate::ledger::{bps_of, ExchangeRate, LedgerError, ShareLedger};
use crate::rebalance::{positions, RebalanceEngine, RebalanceReport};
use crate::storage::VaultStore;
use crate::strategy::StrategyAllocator;
use crate::types::{Address, VaultKey};

use super::snapshot::{Flows, VaultSnapshot, SNAPSHOT_VERSION};

pub(crate) struct VaultState {
    pub key: VaultKey,
    pub address: Address,
    pub config: VaultConfig,
    pub access: AccessControl,
    pub ledger: ShareLedger,
    /// Cash held by the vault itself, not deployed to any strategy.
    pub idle: u64,
    pub allocator: StrategyAllocator,
    pub fees: FeeAccrual,
    pub emergency: EmergencyController,
    pub rebalancer: RebalanceEngine,
    pub settlement: CrossChainSettlement,
    pub events: EventLog,
    pub flows: Flows,
    pub store: Option<VaultStore>,
    dirty_inbound: BTreeSet<Nonce>,
    dirty_outbound: BTreeSet<Nonce>,
}

impl VaultState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: VaultKey,
        address: Address,
        config: VaultConfig,
        access: AccessControl,
        ledger: ShareLedger,
        idle: u64,
        allocator: StrategyAllocator,
        fees: FeeAccrual,
        emergency: EmergencyController,
        rebalancer: RebalanceEngine,
        settlement: CrossChainSettlement,
        flows: Flows,
        store: Option<VaultStore>,
    ) -> Self {
        Self {
            key,
            address,
            config,
            access,
            ledger,
            idle,
            allocator,
            fees,
            emergency,
            rebalancer,
            settlement,
            events: EventLog::new(),
            flows,
            store,
            dirty_inbound: BTreeSet::new(),
            dirty_outbound: BTreeSet::new(),
        }
    }

    pub fn emit(&mut self, now: u64, event: VaultEvent) {
        self.events.push(now, event);
    }

    pub fn authorize(&self, caller: &Address, capability: Capability) -> VaultResult<()> {
        Ok(self.access.authorize(caller, capability)?)
    }

    // -- Valuation -----------------------------------------------------------

    /// Idle cash plus every slot's value. Escrow and bad debt are excluded.
    pub fn total_assets(&mut self) -> u64 {
        self.idle.saturating_add(self.allocator.invested_assets())
    }

    /// The rate the next mutating call will convert at: the pending
    /// management fee is counted as already minted.
    pub fn effective_rate(&mut self, now: u64) -> VaultResult<ExchangeRate> {
        let total_assets = self.total_assets();
        let virtual_shares = self.config.virtual_shares();
        let supply = self.ledger.total_supply();
        let pending = self
            .fees
            .quote_management(total_assets, supply, virtual_shares, now)?;
        let supply = supply
            .checked_add(pending.shares)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        Ok(ExchangeRate::new(total_assets, supply, virtual_shares))
    }

    /// Mints the accrued management fee, then returns the rate to convert at.
    pub fn settle_fees(&mut self, now: u64) -> VaultResult<ExchangeRate> {
        let total_assets = self.total_assets();
        let virtual_shares = self.config.virtual_shares();
        let collected = self.fees.collect_management(
            total_assets,
            self.ledger.total_supply(),
            virtual_shares,
            now,
        )?;
        if let Some((recipient, quote)) = collected {
            self.ledger.mint(&recipient, quote.shares)?;
            self.fees.record_management(quote, now);
            tracing::info!(
                %recipient,
                assets = quote.assets,
                shares = quote.shares,
                "management fee collected"
            );
            self.emit(
                now,
                VaultEvent::FeeCollected {
                    recipient,
                    management_shares: quote.shares,
                    performance_shares: 0,
                },
            );
        }
        Ok(ExchangeRate::new(
            total_assets,
            self.ledger.total_supply(),
            virtual_shares,
        ))
    }

    // -- Inflows -------------------------------------------------------------

    /// Zero and minimum checks on an incoming asset amount.
    pub fn check_inflow_amount(&self, assets: u64) -> VaultResult<()> {
        if assets == 0 {
            return Err(VaultError::ZeroAmount);
        }
        if assets < self.config.min_deposit {
            return Err(VaultError::BelowMinimum {
                amount: assets,
                minimum: self.config.min_deposit,
            });
        }
        Ok(())
    }

    pub fn remaining_capacity(&self, total_assets: u64) -> u64 {
        self.config.deposit_limit.saturating_sub(total_assets)
    }

    pub fn check_capacity(&self, assets: u64, total_assets: u64) -> VaultResult<()> {
        let available = self.remaining_capacity(total_assets);
        if assets > available {
            return Err(VaultError::DepositLimit {
                requested: assets,
                available,
            });
        }
        Ok(())
    }

    /// Credits `assets` to idle cash and mints `shares` to `receiver`.
    /// Nothing changes if either step would overflow.
    pub fn credit(&mut self, receiver: &Address, assets: u64, shares: u64) -> VaultResult<()> {
        let idle = self
            .idle
            .checked_add(assets)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        self.ledger.mint(receiver, shares)?;
        self.idle = idle;
        Ok(())
    }

    /// Whether an inflow is large enough to deploy idle cash right away.
    pub fn is_large_inflow(assets: u64, total_assets_before: u64) -> bool {
        assets as u128 * MAX_BPS as u128 > total_assets_before as u128 * LARGE_DEPOSIT_THRESHOLD_BPS as u128
    }

    /// Deploys at most a quarter of idle cash toward the targets. Bypasses
    /// the rebalance cooldown.
    pub fn deploy_idle(&mut self, now: u64) -> RebalanceReport {
        if self.allocator.is_empty() || self.idle == 0 {
            return RebalanceReport::default();
        }
        let budget = bps_of(self.idle, INCREMENTAL_DEPLOY_BPS);
        let positions = positions(&mut self.allocator);
        let total_assets = positions
            .iter()
            .fold(self.idle, |acc, p| acc.saturating_add(p.current));
        let plan = self.rebalancer.plan_deploy(&positions, total_assets, budget);
        if plan.is_empty() {
            return RebalanceReport::default();
        }
        let report = self.rebalancer.execute(&plan, &mut self.allocator, &mut self.idle);
        tracing::debug!(budget, deployed = report.deposited, "idle cash deployed");
        self.note_breaches(&report, now);
        report
    }

    // -- Outflows ------------------------------------------------------------

    /// Pulls from strategies until idle cash covers `needed`, proportionally
    /// to each slot's share of invested assets.
    pub fn pull_liquidity(&mut self, needed: u64, now: u64) -> RebalanceReport {
        if self.idle >= needed {
            return RebalanceReport::default();
        }
        let missing = needed - self.idle;
        let positions = positions(&mut self.allocator);
        let plan = self.rebalancer.plan_liquidity_pull(&positions, missing);
        let report = self.rebalancer.execute(&plan, &mut self.allocator, &mut self.idle);
        tracing::debug!(
            needed,
            missing,
            recovered = report.withdrawn,
            failures = report.failures.len(),
            "liquidity pulled"
        );
        self.note_breaches(&report, now);
        report
    }

    /// Emergency-withdraws every slot that is active or still reports value,
    /// crediting idle cash. Failing strategies are skipped and keep their
    /// last reported value. Returns the total recovered.
    pub fn unwind_all(&mut self, now: u64) -> u64 {
        let mut total = 0u64;
        for id in self.allocator.ids() {
            let result = match self.allocator.get_mut(id) {
                Ok(slot) if slot.is_active() || slot.record.last_reported_assets > 0 => {
                    let result = slot.emergency_withdraw();
                    if result.is_ok() {
                        slot.record.active = false;
                    }
                    result
                }
                _ => continue,
            };
            match result {
                Ok(recovered) => {
                    self.idle = self.idle.saturating_add(recovered);
                    total = total.saturating_add(recovered);
                    tracing::warn!(strategy = %id, recovered, "strategy unwound");
                    self.emit(now, VaultEvent::StrategyUnwound { strategy: id, recovered });
                }
                Err(e) => {
                    tracing::warn!(strategy = %id, error = %e, "unwind failed, skipping");
                }
            }
        }
        total
    }

    /// Fails with `SlippageExceeded` when idle cash falls short of
    /// `requested` by more than the configured tolerance.
    pub fn check_slippage(&mut self, requested: u64, now: u64) -> VaultResult<()> {
        if self.idle >= requested {
            return Ok(());
        }
        let shortfall = requested - self.idle;
        let max_slippage_bps = self.config.max_slippage_bps;
        if shortfall as u128 * MAX_BPS as u128 > requested as u128 * max_slippage_bps as u128 {
            tracing::warn!(
                requested,
                recovered = self.idle,
                max_slippage_bps,
                "slippage protection triggered"
            );
            self.emit(
                now,
                VaultEvent::SlippageProtectionTriggered {
                    requested,
                    recovered: self.idle,
                    max_slippage_bps,
                },
            );
            return Err(VaultError::SlippageExceeded {
                requested,
                recovered: self.idle,
                max_slippage_bps,
            });
        }
        Ok(())
    }

    /// Takes up to `assets` out of idle cash; returns what was taken.
    pub fn pay_out(&mut self, assets: u64) -> u64 {
        let paid = assets.min(self.idle);
        self.idle -= paid;
        paid
    }

    pub fn note_breaches(&mut self, report: &RebalanceReport, now: u64) {
        for breach in &report.breaches {
            self.emit(
                now,
                VaultEvent::StrategyLossExceeded {
                    strategy: breach.strategy,
                    requested: breach.requested,
                    received: breach.received,
                },
            );
        }
    }

    // -- Persistence ---------------------------------------------------------

    pub fn touch_inbound(&mut self, nonce: Nonce) {
        self.dirty_inbound.insert(nonce);
    }

    pub fn touch_outbound(&mut self, nonce: Nonce) {
        self.dirty_outbound.insert(nonce);
    }

    pub fn snapshot(&self, now: u64) -> VaultSnapshot {
        VaultSnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: now,
            address: self.address.clone(),
            config: self.config.clone(),
            access: self.access.clone(),
            ledger: self.ledger.clone(),
            idle: self.idle,
            fees: self.fees.state().clone(),
            emergency: self.emergency.state(),
            shutdown_at: self.emergency.shutdown_at(),
            last_rebalance_at: self.rebalancer.last_rebalance_at(),
            slots: self.allocator.records(),
            next_strategy_id: self.allocator.next_id(),
            allocation_history: self.allocator.history().to_vec(),
            bad_debt: self.allocator.bad_debt(),
            trusted_chains: self
                .settlement
                .trusted()
                .iter()
                .map(|(c, a)| (*c, a.clone()))
                .collect(),
            remote_views: self
                .settlement
                .remote_views()
                .iter()
                .map(|(c, v)| (*c, *v))
                .collect(),
            inbound_duplicates: self.settlement.inbox().duplicates(),
            flows: self.flows,
        }
    }

    /// Writes the snapshot and every touched message record in one store
    /// transaction. Without a store the dirty sets are just cleared.
    pub fn commit(&mut self, now: u64) -> VaultResult<()> {
        if let Some(store) = &self.store {
            let snapshot = self.snapshot(now);
            let inbox = self.settlement.inbox();
            let outbox = self.settlement.outbox();
            let inbound: Vec<&InboundRecord> = self
                .dirty_inbound
                .iter()
                .filter_map(|n| inbox.get(n))
                .collect();
            let outbound: Vec<&OutboundRecord> = self
                .dirty_outbound
                .iter()
                .filter_map(|n| outbox.get(n))
                .collect();
            store.commit(&self.key, &snapshot, &inbound, &outbound)?;
        }
        self.dirty_inbound.clear();
        self.dirty_outbound.clear();
        Ok(())
    }
}
