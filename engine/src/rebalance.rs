//! # Rebalance Engine
//!
//! Computes and executes capital movement between idle cash and strategies.
//! Planning is pure: it works on a [`Position`] snapshot of every slot and
//! returns a [`RebalancePlan`]. Execution walks the plan against the live
//! allocator, withdrawals first so the freed cash can fund the deposits.
//!
//! Three planners cover the three callers:
//!
//! | planner               | caller                    | rate limited |
//! |-----------------------|---------------------------|--------------|
//! | `plan_full`           | `rebalance()`             | yes          |
//! | `plan_deploy`         | large deposit, inbound    | no (capped)  |
//! | `plan_liquidity_pull` | withdraw / redeem         | no           |
//!
//! Strategy failures during execution are skip-and-log: one broken
//! strategy never stops the others from being processed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MAX_BPS;
use crate::ledger::{mul_div, Rounding};
use crate::strategy::{StrategyAllocator, StrategyError, StrategyId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RebalanceError {
    #[error("rebalance cooling down until {next_allowed_at}")]
    Cooldown { next_allowed_at: u64 },
}

/// Snapshot of one slot used for planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub id: StrategyId,
    pub active: bool,
    pub allocation_bps: u64,
    pub current: u64,
}

impl Position {
    pub fn target(&self, total_assets: u64) -> u64 {
        mul_div(
            total_assets,
            self.allocation_bps as u128,
            MAX_BPS as u128,
            Rounding::Down,
        )
        .unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub strategy: StrategyId,
    pub amount: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    pub withdrawals: Vec<Move>,
    pub deposits: Vec<Move>,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.withdrawals.is_empty() && self.deposits.is_empty()
    }
}

/// A strategy that returned more than its loss tolerance allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossBreach {
    pub strategy: StrategyId,
    pub requested: u64,
    pub received: u64,
}

/// What an executed plan actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub withdrawn: u64,
    pub deposited: u64,
    /// `Σ requested - Σ received` over withdrawals.
    pub shortfall: u64,
    pub failures: Vec<(StrategyId, String)>,
    pub breaches: Vec<LossBreach>,
}

impl RebalanceReport {
    fn fail(&mut self, id: StrategyId, op: &str, e: &StrategyError) {
        tracing::warn!(strategy = %id, op, error = %e, "strategy call failed, skipping");
        self.failures.push((id, e.to_string()));
    }
}

/// Snapshots every slot's position, valuing failing strategies at their
/// last reported value.
pub fn positions(allocator: &mut StrategyAllocator) -> Vec<Position> {
    allocator
        .slots_mut()
        .map(|slot| Position {
            id: slot.id(),
            active: slot.is_active(),
            allocation_bps: slot.record.allocation_bps,
            current: slot.assets_or_last_known(),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceEngine {
    min_interval_secs: u64,
    last_rebalance_at: Option<u64>,
}

impl RebalanceEngine {
    pub fn new(min_interval_secs: u64) -> Self {
        Self {
            min_interval_secs,
            last_rebalance_at: None,
        }
    }

    pub fn with_last_rebalance(min_interval_secs: u64, last_rebalance_at: Option<u64>) -> Self {
        Self {
            min_interval_secs,
            last_rebalance_at,
        }
    }

    pub fn last_rebalance_at(&self) -> Option<u64> {
        self.last_rebalance_at
    }

    pub fn ensure_ready(&self, now: u64) -> Result<(), RebalanceError> {
        if let Some(last) = self.last_rebalance_at {
            let next_allowed_at = last.saturating_add(self.min_interval_secs);
            if now < next_allowed_at {
                return Err(RebalanceError::Cooldown { next_allowed_at });
            }
        }
        Ok(())
    }

    pub fn mark_rebalanced(&mut self, now: u64) {
        self.last_rebalance_at = Some(now);
    }

    // -- Planning ------------------------------------------------------------

    /// Moves every active slot toward `total_assets * allocation / 10_000`.
    /// Inactive slots are left untouched.
    pub fn plan_full(&self, positions: &[Position], total_assets: u64, idle: u64) -> RebalancePlan {
        let mut plan = RebalancePlan::default();
        let mut cash = idle;

        for p in positions.iter().filter(|p| p.active) {
            let target = p.target(total_assets);
            if p.current > target {
                let amount = p.current - target;
                cash = cash.saturating_add(amount);
                plan.withdrawals.push(Move {
                    strategy: p.id,
                    amount,
                });
            }
        }
        for p in positions.iter().filter(|p| p.active) {
            let target = p.target(total_assets);
            if target > p.current && cash > 0 {
                let amount = (target - p.current).min(cash);
                cash -= amount;
                plan.deposits.push(Move {
                    strategy: p.id,
                    amount,
                });
            }
        }
        plan
    }

    /// Distributes at most `budget` of idle cash over active slots below
    /// target, in id order.
    pub fn plan_deploy(&self, positions: &[Position], total_assets: u64, budget: u64) -> RebalancePlan {
        let mut plan = RebalancePlan::default();
        let mut remaining = budget;
        for p in positions.iter().filter(|p| p.active) {
            if remaining == 0 {
                break;
            }
            let target = p.target(total_assets);
            if target > p.current {
                let amount = (target - p.current).min(remaining);
                remaining -= amount;
                plan.deposits.push(Move {
                    strategy: p.id,
                    amount,
                });
            }
        }
        plan
    }

    /// Pulls `needed` from every slot holding assets, proportionally to its
    /// share of total invested assets (rounded up so the sum covers the
    /// need). Inactive slots are included: their funds belong to holders.
    pub fn plan_liquidity_pull(&self, positions: &[Position], needed: u64) -> RebalancePlan {
        let mut plan = RebalancePlan::default();
        let invested: u128 = positions.iter().map(|p| p.current as u128).sum();
        if needed == 0 || invested == 0 {
            return plan;
        }
        for p in positions.iter().filter(|p| p.current > 0) {
            let amount = if needed as u128 >= invested {
                p.current
            } else {
                mul_div(p.current, needed as u128, invested, Rounding::Up)
                    .unwrap_or(p.current)
                    .min(p.current)
            };
            if amount > 0 {
                plan.withdrawals.push(Move {
                    strategy: p.id,
                    amount,
                });
            }
        }
        plan
    }

    // -- Execution -----------------------------------------------------------

    /// Executes `plan` against the live slots, moving cash through `idle`.
    /// Deposits are capped by the idle cash actually available.
    pub fn execute(
        &self,
        plan: &RebalancePlan,
        allocator: &mut StrategyAllocator,
        idle: &mut u64,
    ) -> RebalanceReport {
        let mut report = RebalanceReport::default();

        for mv in &plan.withdrawals {
            let Ok(slot) = allocator.get_mut(mv.strategy) else {
                continue;
            };
            match slot.withdraw(mv.amount) {
                Ok(received) => {
                    *idle = idle.saturating_add(received);
                    report.withdrawn += received;
                    report.shortfall += mv.amount.saturating_sub(received);
                    if slot.loss_exceeds_tolerance(mv.amount, received) {
                        tracing::warn!(
                            strategy = %mv.strategy,
                            requested = mv.amount,
                            received,
                            max_loss_bps = slot.record.max_loss_bps,
                            "strategy loss above tolerance, deactivating"
                        );
                        slot.record.active = false;
                        report.breaches.push(LossBreach {
                            strategy: mv.strategy,
                            requested: mv.amount,
                            received,
                        });
                    }
                    let _ = slot.refresh_assets();
                }
                Err(e) => report.fail(mv.strategy, "withdraw", &e),
            }
        }

        for mv in &plan.deposits {
            let amount = mv.amount.min(*idle);
            if amount == 0 {
                break;
            }
            let Ok(slot) = allocator.get_mut(mv.strategy) else {
                continue;
            };
            if !slot.is_active() {
                continue;
            }
            match slot.invest(amount) {
                Ok(invested) => {
                    *idle -= invested;
                    report.deposited += invested;
                    let _ = slot.refresh_assets();
                }
                Err(e) => report.fail(mv.strategy, "invest", &e),
            }
        }

        tracing::debug!(
            withdrawn = report.withdrawn,
            deposited = report.deposited,
            failures = report.failures.len(),
            "plan executed"
        );
        report
    }
}
