//! Privileged entry points: strategy management, rebalancing, harvest,
//! fees, emergency transitions, roles and chain trust.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::access::{Capability, Role};
use crate::emergency::{EmergencyError, EmergencyState};
use crate::error::VaultResult;
use crate::events::VaultEvent;
use crate::rebalance::{positions, RebalanceReport};
use crate::strategy::{AllocationChange, Strategy, StrategyError, StrategyId};
use crate::types::{Address, ChainId};

use super::state::VaultState;
use super::Vault;

/// Outcome of a harvest over one or more strategies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestReport {
    /// Realized proceeds credited to idle cash.
    pub harvested: u64,
    pub per_strategy: Vec<(StrategyId, u64)>,
    /// Strategies whose harvest failed, skipped.
    pub failures: Vec<(StrategyId, String)>,
    pub performance_fee_shares: u64,
}

impl VaultState {
    fn rebalance(&mut self, now: u64) -> VaultResult<RebalanceReport> {
        self.emergency.ensure_normal("rebalance")?;
        self.rebalancer.ensure_ready(now)?;
        self.settle_fees(now)?;

        let positions = positions(&mut self.allocator);
        let total_assets = positions
            .iter()
            .fold(self.idle, |acc, p| acc.saturating_add(p.current));
        let plan = self.rebalancer.plan_full(&positions, total_assets, self.idle);
        let report = self.rebalancer.execute(&plan, &mut self.allocator, &mut self.idle);
        self.rebalancer.mark_rebalanced(now);
        self.note_breaches(&report, now);

        tracing::info!(
            withdrawn = report.withdrawn,
            deposited = report.deposited,
            shortfall = report.shortfall,
            failures = report.failures.len(),
            "rebalanced"
        );
        self.emit(
            now,
            VaultEvent::Rebalanced {
                withdrawn: report.withdrawn,
                deposited: report.deposited,
                failures: report.failures.len(),
            },
        );
        Ok(report)
    }

    /// Harvests `ids` with skip-and-log semantics, then charges the
    /// performance fee on the realized sum.
    fn harvest(&mut self, now: u64, ids: &[StrategyId]) -> VaultResult<HarvestReport> {
        self.settle_fees(now)?;
        let mut report = HarvestReport::default();

        for id in ids {
            let Ok(slot) = self.allocator.get_mut(*id) else {
                continue;
            };
            match slot.harvest(now) {
                Ok(amount) => {
                    self.idle = self.idle.saturating_add(amount);
                    report.harvested = report.harvested.saturating_add(amount);
                    report.per_strategy.push((*id, amount));
                    if amount > 0 {
                        self.emit(now, VaultEvent::StrategyHarvested { strategy: *id, amount });
                    }
                }
                Err(e) => {
                    tracing::warn!(strategy = %id, error = %e, "harvest failed, skipping");
                    report.failures.push((*id, e.to_string()));
                }
            }
        }
        self.flows.harvested = self.flows.harvested.saturating_add(report.harvested);

        if report.harvested > 0 {
            let total_assets = self.total_assets();
            let quote = self.fees.quote_performance(
                report.harvested,
                total_assets,
                self.ledger.total_supply(),
                self.config.virtual_shares(),
            )?;
            if let (false, Some(recipient)) = (quote.is_zero(), self.fees.recipient().cloned()) {
                self.ledger.mint(&recipient, quote.shares)?;
                self.fees.record_performance(quote);
                report.performance_fee_shares = quote.shares;
                tracing::info!(%recipient, assets = quote.assets, shares = quote.shares, "performance fee collected");
                self.emit(
                    now,
                    VaultEvent::FeeCollected {
                        recipient,
                        management_shares: 0,
                        performance_shares: quote.shares,
                    },
                );
            }
        }
        Ok(report)
    }

    fn remove_strategy(&mut self, now: u64, id: StrategyId) -> VaultResult<u64> {
        self.settle_fees(now)?;
        let removal = self.allocator.remove(id, now)?;
        self.idle = self.idle.saturating_add(removal.recovered);
        if let Some(debt) = removal.bad_debt.filter(|d| d.amount > 0) {
            self.flows.written_off = self.flows.written_off.saturating_add(debt.amount);
            self.emit(
                now,
                VaultEvent::BadDebtRecorded {
                    strategy: id,
                    amount: debt.amount,
                },
            );
        }
        self.emit(
            now,
            VaultEvent::StrategyRemoved {
                strategy: id,
                recovered: removal.recovered,
            },
        );
        Ok(removal.recovered)
    }

    fn unwind_strategy(&mut self, now: u64, id: StrategyId) -> VaultResult<u64> {
        self.emergency.ensure_halted("emergency_withdraw_strategy")?;
        let slot = self.allocator.get_mut(id)?;
        let recovered = slot.emergency_withdraw()?;
        slot.record.active = false;
        self.idle = self.idle.saturating_add(recovered);
        tracing::warn!(strategy = %id, recovered, "strategy unwound");
        self.emit(now, VaultEvent::StrategyUnwound { strategy: id, recovered });
        Ok(recovered)
    }
}

impl Vault {
    // -- Strategies ----------------------------------------------------------

    /// Registers a strategy. Returns its id.
    pub fn add_strategy(
        &self,
        caller: &Address,
        strategy: Arc<dyn Strategy>,
        allocation_bps: u64,
        max_loss_bps: u64,
    ) -> VaultResult<StrategyId> {
        self.mutate("add_strategy", |s, now| {
            s.authorize(caller, Capability::ManageStrategies)?;
            if s.emergency.is_shutdown() {
                return Err(EmergencyError::NotAllowed {
                    op: "add_strategy",
                    state: EmergencyState::EmergencyShutdown,
                }
                .into());
            }
            let id = s.allocator.add(strategy, allocation_bps, max_loss_bps, now)?;
            let name = s.allocator.get(id)?.record.name.clone();
            s.emit(
                now,
                VaultEvent::StrategyAdded {
                    strategy: id,
                    name,
                    allocation_bps,
                },
            );
            Ok(id)
        })
    }

    /// Unwinds and removes a strategy. Returns the assets recovered; a
    /// failed unwind is written off as bad debt and does not block removal.
    pub fn remove_strategy(&self, caller: &Address, id: StrategyId) -> VaultResult<u64> {
        self.mutate("remove_strategy", |s, now| {
            s.authorize(caller, Capability::ManageStrategies)?;
            s.remove_strategy(now, id)
        })
    }

    pub fn update_allocation(
        &self,
        caller: &Address,
        id: StrategyId,
        allocation_bps: u64,
    ) -> VaultResult<AllocationChange> {
        self.mutate("update_allocation", |s, now| {
            s.authorize(caller, Capability::ManageStrategies)?;
            let change = s.allocator.update_allocation(id, allocation_bps, now)?;
            s.emit(
                now,
                VaultEvent::AllocationUpdated {
                    strategy: id,
                    from_bps: change.from_bps,
                    to_bps: change.to_bps,
                },
            );
            Ok(change)
        })
    }

    pub fn set_strategy_active(&self, caller: &Address, id: StrategyId, active: bool) -> VaultResult<()> {
        self.mutate("set_strategy_active", |s, _| {
            s.authorize(caller, Capability::ManageStrategies)?;
            Ok(s.allocator.set_active(id, active)?)
        })
    }

    /// Pulls everything out of one strategy and deactivates it. Only
    /// while paused or shut down.
    pub fn emergency_withdraw_strategy(&self, caller: &Address, id: StrategyId) -> VaultResult<u64> {
        self.mutate("emergency_withdraw_strategy", |s, now| {
            s.authorize(caller, Capability::EmergencyShutdown)?;
            s.unwind_strategy(now, id)
        })
    }

    /// Retries the unwind of a written-off strategy.
    pub fn recover_bad_debt(&self, caller: &Address, id: StrategyId) -> VaultResult<u64> {
        self.mutate("recover_bad_debt", |s, now| {
            s.authorize(caller, Capability::RecoverFunds)?;
            let recovered = s.allocator.recover_bad_debt(id)?;
            s.idle = s.idle.saturating_add(recovered);
            s.flows.recovered = s.flows.recovered.saturating_add(recovered);
            s.emit(
                now,
                VaultEvent::BadDebtRecovered {
                    strategy: id,
                    amount: recovered,
                },
            );
            Ok(recovered)
        })
    }

    // -- Capital movement ----------------------------------------------------

    /// Full rebalance toward target allocations. Rate limited.
    pub fn rebalance(&self, caller: &Address) -> VaultResult<RebalanceReport> {
        self.mutate("rebalance", |s, now| {
            s.authorize(caller, Capability::Rebalance)?;
            s.rebalance(now)
        })
    }

    /// Harvests every active strategy.
    pub fn harvest_all(&self, caller: &Address) -> VaultResult<HarvestReport> {
        self.mutate("harvest_all", |s, now| {
            s.authorize(caller, Capability::Harvest)?;
            let ids = s.allocator.active_ids();
            s.harvest(now, &ids)
        })
    }

    /// Harvests one strategy. Unlike [`Vault::harvest_all`], a failure is
    /// returned to the caller.
    pub fn harvest(&self, caller: &Address, id: StrategyId) -> VaultResult<HarvestReport> {
        self.mutate("harvest", |s, now| {
            s.authorize(caller, Capability::Harvest)?;
            s.allocator.get(id)?;
            let report = s.harvest(now, &[id])?;
            if let Some((_, reason)) = report.failures.first() {
                return Err(StrategyError::reverted("harvest", reason.clone()).into());
            }
            Ok(report)
        })
    }

    /// Mints the accrued management fee now.
    pub fn collect_fees(&self, caller: &Address) -> VaultResult<()> {
        self.mutate("collect_fees", |s, now| {
            s.authorize(caller, Capability::Harvest)?;
            s.settle_fees(now)?;
            Ok(())
        })
    }

    // -- Fees ----------------------------------------------------------------

    /// Changes the fee recipient. Fees accrued so far go to the old one.
    pub fn set_fee_recipient(&self, caller: &Address, recipient: Address) -> VaultResult<()> {
        self.mutate("set_fee_recipient", |s, now| {
            s.authorize(caller, Capability::SetFeeRecipient)?;
            s.settle_fees(now)?;
            tracing::info!(%recipient, "fee recipient changed");
            s.fees.set_recipient(recipient);
            Ok(())
        })
    }

    pub fn set_fees(&self, caller: &Address, management_fee_bps: u64, performance_fee_bps: u64) -> VaultResult<()> {
        self.mutate("set_fees", |s, now| {
            s.authorize(caller, Capability::SetFees)?;
            s.settle_fees(now)?;
            s.fees.set_fees(management_fee_bps, performance_fee_bps, now)?;
            s.config.management_fee_bps = management_fee_bps;
            s.config.performance_fee_bps = performance_fee_bps;
            tracing::info!(management_fee_bps, performance_fee_bps, "fees changed");
            Ok(())
        })
    }

    // -- Emergency -----------------------------------------------------------

    pub fn pause(&self, caller: &Address) -> VaultResult<()> {
        self.mutate("pause", |s, now| {
            s.authorize(caller, Capability::Pause)?;
            s.emergency.pause()?;
            s.emit(now, VaultEvent::Paused);
            Ok(())
        })
    }

    pub fn unpause(&self, caller: &Address) -> VaultResult<()> {
        self.mutate("unpause", |s, now| {
            s.authorize(caller, Capability::Pause)?;
            s.emergency.unpause()?;
            s.emit(now, VaultEvent::Unpaused);
            Ok(())
        })
    }

    /// Enters emergency shutdown. Rebalancing and auto-invest stop; the
    /// emergency withdrawal path opens.
    pub fn activate_shutdown(&self, caller: &Address) -> VaultResult<EmergencyState> {
        self.mutate("activate_shutdown", |s, now| {
            s.authorize(caller, Capability::EmergencyShutdown)?;
            let previous = s.emergency.activate_shutdown(now)?;
            s.emit(now, VaultEvent::EmergencyShutdownActivated { previous });
            Ok(previous)
        })
    }

    /// Leaves shutdown into `Paused`.
    pub fn clear_shutdown(&self, caller: &Address) -> VaultResult<()> {
        self.mutate("clear_shutdown", |s, now| {
            s.authorize(caller, Capability::EmergencyShutdown)?;
            s.emergency.clear_shutdown()?;
            s.emit(now, VaultEvent::EmergencyShutdownCleared);
            Ok(())
        })
    }

    // -- Roles & trust -------------------------------------------------------

    pub fn grant_role(&self, caller: &Address, account: &Address, role: Role) -> VaultResult<bool> {
        self.mutate("grant_role", |s, now| {
            let granted = s.access.grant(caller, account, role)?;
            if granted {
                tracing::info!(%account, %role, "role granted");
                s.emit(
                    now,
                    VaultEvent::RoleGranted {
                        account: account.clone(),
                        role,
                    },
                );
            }
            Ok(granted)
        })
    }

    pub fn revoke_role(&self, caller: &Address, account: &Address, role: Role) -> VaultResult<bool> {
        self.mutate("revoke_role", |s, now| {
            let revoked = s.access.revoke(caller, account, role)?;
            if revoked {
                tracing::info!(%account, %role, "role revoked");
                s.emit(
                    now,
                    VaultEvent::RoleRevoked {
                        account: account.clone(),
                        role,
                    },
                );
            }
            Ok(revoked)
        })
    }

    /// Trusts `remote_vault` as this vault's counterpart on `chain`.
    pub fn trust_chain(&self, caller: &Address, chain: ChainId, remote_vault: Address) -> VaultResult<()> {
        self.mutate("trust_chain", |s, _| {
            s.authorize(caller, Capability::ConfigureChains)?;
            s.settlement.trust_chain(chain, remote_vault);
            Ok(())
        })
    }

    pub fn untrust_chain(&self, caller: &Address, chain: ChainId) -> VaultResult<bool> {
        self.mutate("untrust_chain", |s, _| {
            s.authorize(caller, Capability::ConfigureChains)?;
            Ok(s.settlement.untrust_chain(chain))
        })
    }
}
