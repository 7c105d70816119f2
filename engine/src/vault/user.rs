//! Holder entry points: deposit, mint, withdraw, redeem, the emergency
//! exit, share transfers and allowances, plus their previews.

use crate::error::{VaultError, VaultResult};
use crate::events::VaultEvent;
use crate::ledger::{mul_div, LedgerError, Rounding};
use crate::types::Address;

use super::state::VaultState;
use super::Vault;

/// One withdrawal, after the share/asset conversion.
struct Exit<'a> {
    caller: &'a Address,
    receiver: &'a Address,
    owner: &'a Address,
    assets: u64,
    shares: u64,
}

impl VaultState {
    fn deposit(&mut self, now: u64, caller: &Address, receiver: &Address, assets: u64) -> VaultResult<u64> {
        self.emergency.ensure_normal("deposit")?;
        self.check_inflow_amount(assets)?;
        let rate = self.settle_fees(now)?;
        self.check_capacity(assets, rate.total_assets)?;
        let shares = rate.to_shares(assets, Rounding::Down)?;
        if shares == 0 {
            return Err(VaultError::ZeroShares);
        }
        self.accept(now, caller, receiver, assets, shares, rate.total_assets)?;
        Ok(shares)
    }

    fn mint(&mut self, now: u64, caller: &Address, receiver: &Address, shares: u64) -> VaultResult<u64> {
        self.emergency.ensure_normal("mint")?;
        if shares == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let rate = self.settle_fees(now)?;
        let assets = rate.to_assets(shares, Rounding::Up)?;
        self.check_inflow_amount(assets)?;
        self.check_capacity(assets, rate.total_assets)?;
        self.accept(now, caller, receiver, assets, shares, rate.total_assets)?;
        Ok(assets)
    }

    fn accept(
        &mut self,
        now: u64,
        caller: &Address,
        receiver: &Address,
        assets: u64,
        shares: u64,
        total_assets_before: u64,
    ) -> VaultResult<()> {
        self.credit(receiver, assets, shares)?;
        self.flows.deposited = self.flows.deposited.saturating_add(assets);
        tracing::info!(%caller, %receiver, assets, shares, "deposit");
        self.emit(
            now,
            VaultEvent::Deposit {
                caller: caller.clone(),
                receiver: receiver.clone(),
                assets,
                shares,
            },
        );
        if Self::is_large_inflow(assets, total_assets_before) {
            self.deploy_idle(now);
        }
        Ok(())
    }

    fn withdraw(
        &mut self,
        now: u64,
        caller: &Address,
        assets: u64,
        receiver: &Address,
        owner: &Address,
    ) -> VaultResult<u64> {
        self.emergency.ensure_withdrawals_open("withdraw")?;
        if assets == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let rate = self.settle_fees(now)?;
        let shares = rate.to_shares(assets, Rounding::Up)?;
        self.exit(
            now,
            Exit {
                caller,
                receiver,
                owner,
                assets,
                shares,
            },
        )?;
        Ok(shares)
    }

    fn redeem(
        &mut self,
        now: u64,
        caller: &Address,
        shares: u64,
        receiver: &Address,
        owner: &Address,
    ) -> VaultResult<u64> {
        self.emergency.ensure_withdrawals_open("redeem")?;
        if shares == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let rate = self.settle_fees(now)?;
        let assets = rate.to_assets(shares, Rounding::Down)?;
        if assets == 0 {
            return Err(VaultError::ZeroAssets);
        }
        self.exit(
            now,
            Exit {
                caller,
                receiver,
                owner,
                assets,
                shares,
            },
        )
    }

    /// Checks balance and allowance, sources liquidity, applies the
    /// slippage bound, then burns and pays. Returns the assets paid.
    fn exit(&mut self, now: u64, exit: Exit<'_>) -> VaultResult<u64> {
        let available = self.ledger.balance_of(exit.owner);
        if available < exit.shares {
            return Err(LedgerError::InsufficientShares {
                holder: exit.owner.clone(),
                available,
                requested: exit.shares,
            }
            .into());
        }
        self.ledger
            .check_allowance(exit.owner, exit.caller, exit.shares)?;

        self.pull_liquidity(exit.assets, now);
        self.check_slippage(exit.assets, now)?;

        self.ledger
            .spend_allowance(exit.owner, exit.caller, exit.shares)?;
        self.ledger.burn(exit.owner, exit.shares)?;
        let paid = self.pay_out(exit.assets);
        self.flows.withdrawn = self.flows.withdrawn.saturating_add(paid);
        tracing::info!(
            caller = %exit.caller,
            receiver = %exit.receiver,
            owner = %exit.owner,
            assets = paid,
            shares = exit.shares,
            "withdraw"
        );
        self.emit(
            now,
            VaultEvent::Withdraw {
                caller: exit.caller.clone(),
                receiver: exit.receiver.clone(),
                owner: exit.owner.clone(),
                assets: paid,
                shares: exit.shares,
            },
        );
        Ok(paid)
    }

    /// Shutdown exit: no slippage bound. Strategies are unwound first,
    /// then the holder takes `shares / supply` of the idle cash, capped
    /// at the marked value of the shares. Holders exiting one after
    /// another get the same pro-rata share of what was reachable.
    fn emergency_withdraw(&mut self, now: u64, owner: &Address, shares: u64) -> VaultResult<u64> {
        self.emergency.ensure_shutdown("emergency_withdraw")?;
        if shares == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let available = self.ledger.balance_of(owner);
        if available < shares {
            return Err(LedgerError::InsufficientShares {
                holder: owner.clone(),
                available,
                requested: shares,
            }
            .into());
        }
        let rate = self.settle_fees(now)?;
        let owed = rate.to_assets(shares, Rounding::Down)?;
        self.unwind_all(now);
        let supply = self.ledger.total_supply();
        let reachable = mul_div(self.idle, shares as u128, supply as u128, Rounding::Down)?;
        let payout = owed.min(reachable);

        self.ledger.burn(owner, shares)?;
        let paid = self.pay_out(payout);
        self.flows.withdrawn = self.flows.withdrawn.saturating_add(paid);
        if paid < owed {
            tracing::warn!(%owner, owed, paid, "emergency withdrawal paid short");
        }
        self.emit(
            now,
            VaultEvent::EmergencyWithdraw {
                owner: owner.clone(),
                shares,
                assets: paid,
            },
        );
        Ok(paid)
    }

    fn transfer_shares(&mut self, from: &Address, to: &Address, shares: u64) -> VaultResult<()> {
        if shares == 0 {
            return Err(VaultError::ZeroAmount);
        }
        self.ledger.transfer(from, to, shares)?;
        tracing::debug!(%from, %to, shares, "shares transferred");
        Ok(())
    }
}

impl Vault {
    /// Deposits `assets` and mints shares to `receiver`. Returns the shares.
    pub fn deposit(&self, caller: &Address, assets: u64, receiver: &Address) -> VaultResult<u64> {
        self.mutate("deposit", |s, now| s.deposit(now, caller, receiver, assets))
    }

    /// Mints exactly `shares` to `receiver`. Returns the assets charged.
    pub fn mint(&self, caller: &Address, shares: u64, receiver: &Address) -> VaultResult<u64> {
        self.mutate("mint", |s, now| s.mint(now, caller, receiver, shares))
    }

    /// Pays exactly `assets` (less tolerated slippage) out of `owner`'s
    /// position. Returns the shares burned.
    pub fn withdraw(
        &self,
        caller: &Address,
        assets: u64,
        receiver: &Address,
        owner: &Address,
    ) -> VaultResult<u64> {
        self.mutate("withdraw", |s, now| s.withdraw(now, caller, assets, receiver, owner))
    }

    /// Burns exactly `shares` of `owner`. Returns the assets paid.
    pub fn redeem(
        &self,
        caller: &Address,
        shares: u64,
        receiver: &Address,
        owner: &Address,
    ) -> VaultResult<u64> {
        self.mutate("redeem", |s, now| s.redeem(now, caller, shares, receiver, owner))
    }

    /// Burns `shares` of `owner` during emergency shutdown.
    pub fn emergency_withdraw(&self, owner: &Address, shares: u64) -> VaultResult<u64> {
        self.mutate("emergency_withdraw", |s, now| {
            s.emergency_withdraw(now, owner, shares)
        })
    }

    pub fn transfer_shares(&self, from: &Address, to: &Address, shares: u64) -> VaultResult<()> {
        self.mutate("transfer_shares", |s, _| s.transfer_shares(from, to, shares))
    }

    pub fn approve(&self, owner: &Address, spender: &Address, shares: u64) -> VaultResult<()> {
        self.mutate("approve", |s, _| {
            s.ledger.approve(owner, spender, shares);
            Ok(())
        })
    }

    // -- Previews ------------------------------------------------------------

    pub fn preview_deposit(&self, assets: u64) -> VaultResult<u64> {
        self.read("preview_deposit", |s, now| {
            Ok(s.effective_rate(now)?.to_shares(assets, Rounding::Down)?)
        })
    }

    pub fn preview_mint(&self, shares: u64) -> VaultResult<u64> {
        self.read("preview_mint", |s, now| {
            Ok(s.effective_rate(now)?.to_assets(shares, Rounding::Up)?)
        })
    }

    pub fn preview_withdraw(&self, assets: u64) -> VaultResult<u64> {
        self.read("preview_withdraw", |s, now| {
            Ok(s.effective_rate(now)?.to_shares(assets, Rounding::Up)?)
        })
    }

    pub fn preview_redeem(&self, shares: u64) -> VaultResult<u64> {
        self.read("preview_redeem", |s, now| {
            Ok(s.effective_rate(now)?.to_assets(shares, Rounding::Down)?)
        })
    }

    pub fn convert_to_shares(&self, assets: u64) -> VaultResult<u64> {
        self.preview_deposit(assets)
    }

    pub fn convert_to_assets(&self, shares: u64) -> VaultResult<u64> {
        self.preview_redeem(shares)
    }

    // -- Limits --------------------------------------------------------------

    /// Assets `deposit` would accept right now.
    pub fn max_deposit(&self) -> VaultResult<u64> {
        self.read("max_deposit", |s, _| {
            if s.emergency.ensure_normal("deposit").is_err() {
                return Ok(0);
            }
            let total_assets = s.total_assets();
            Ok(s.remaining_capacity(total_assets))
        })
    }

    pub fn max_mint(&self) -> VaultResult<u64> {
        self.read("max_mint", |s, now| {
            if s.emergency.ensure_normal("mint").is_err() {
                return Ok(0);
            }
            let rate = s.effective_rate(now)?;
            let capacity = s.remaining_capacity(rate.total_assets);
            Ok(rate
                .to_shares(capacity, Rounding::Down)
                .unwrap_or(u64::MAX))
        })
    }

    /// Assets `owner` could withdraw, ignoring strategy liquidity.
    pub fn max_withdraw(&self, owner: &Address) -> VaultResult<u64> {
        self.read("max_withdraw", |s, now| {
            if s.emergency.ensure_withdrawals_open("withdraw").is_err() {
                return Ok(0);
            }
            let shares = s.ledger.balance_of(owner);
            Ok(s.effective_rate(now)?.to_assets(shares, Rounding::Down)?)
        })
    }

    pub fn max_redeem(&self, owner: &Address) -> VaultResult<u64> {
        self.read("max_redeem", |s, _| {
            if s.emergency.ensure_withdrawals_open("redeem").is_err() {
                return Ok(0);
            }
            Ok(s.ledger.balance_of(owner))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::VaultConfig;
    use crate::error::ErrorKind;
    use crate::events::VaultEvent;
    use crate::strategy::testing::MockStrategy;
    use crate::types::{AssetId, ChainId, ManualClock};
    use crate::vault::{Vault, VaultBuilder};

    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn vault_with(config: VaultConfig) -> (Vault, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let vault = VaultBuilder::new(config, addr("admin"))
            .clock(clock.clone())
            .build()
            .unwrap();
        (vault, clock)
    }

    fn config() -> VaultConfig {
        let mut cfg = VaultConfig::new(AssetId::new("USDC"), ChainId(1));
        cfg.management_fee_bps = 0;
        cfg.performance_fee_bps = 0;
        cfg
    }

    #[test]
    fn first_deposit_mints_one_to_one() {
        let (vault, _) = vault_with(config());
        let alice = addr("alice");
        assert_eq!(vault.preview_deposit(1_000).unwrap(), 1_000);
        assert_eq!(vault.deposit(&alice, 1_000, &alice).unwrap(), 1_000);
        assert_eq!(vault.balance_of(&alice).unwrap(), 1_000);
        assert_eq!(vault.total_assets().unwrap(), 1_000);
    }

    #[test]
    fn zero_and_below_minimum_rejected() {
        let mut cfg = config();
        cfg.min_deposit = 10;
        let (vault, _) = vault_with(cfg);
        let alice = addr("alice");
        assert!(matches!(vault.deposit(&alice, 0, &alice), Err(VaultError::ZeroAmount)));
        let err = vault.deposit(&alice, 9, &alice).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(vault.total_supply().unwrap(), 0);
    }

    #[test]
    fn deposit_limit_is_a_capacity_error() {
        let mut cfg = config();
        cfg.deposit_limit = 1_500;
        let (vault, _) = vault_with(cfg);
        let alice = addr("alice");
        vault.deposit(&alice, 1_000, &alice).unwrap();
        let err = vault.deposit(&alice, 501, &alice).unwrap_err();
        assert!(matches!(err, VaultError::DepositLimit { available: 500, .. }));
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(vault.max_deposit().unwrap(), 500);
    }

    #[test]
    fn mint_charges_rounded_up() {
        let (vault, _) = vault_with(config());
        let alice = addr("alice");
        vault.deposit(&alice, 1_000, &alice).unwrap();
        let strategy = Arc::new(MockStrategy::new("USDC"));
        vault
            .add_strategy(&addr("admin"), strategy.clone(), 10_000, 50)
            .unwrap();
        strategy.grow(100);
        let bob = addr("bob");
        let preview = vault.preview_mint(10).unwrap();
        assert_eq!(vault.mint(&bob, 10, &bob).unwrap(), preview);
        // 10 * 1101 / 1001 = 10.99
        assert_eq!(preview, 11);
    }

    #[test]
    fn withdraw_burns_previewed_shares() {
        let (vault, _) = vault_with(config());
        let alice = addr("alice");
        vault.deposit(&alice, 1_000, &alice).unwrap();
        let preview = vault.preview_withdraw(400).unwrap();
        assert_eq!(vault.withdraw(&alice, 400, &alice, &alice).unwrap(), preview);
        assert_eq!(vault.balance_of(&alice).unwrap(), 600);
        assert_eq!(vault.total_assets().unwrap(), 600);
    }

    #[test]
    fn withdraw_beyond_balance_has_no_effect() {
        let (vault, _) = vault_with(config());
        let alice = addr("alice");
        vault.deposit(&alice, 100, &alice).unwrap();
        let err = vault.redeem(&alice, 101, &alice, &alice).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(vault.balance_of(&alice).unwrap(), 100);
        assert_eq!(vault.total_assets().unwrap(), 100);
    }

    #[test]
    fn third_party_redeem_needs_allowance() {
        let (vault, _) = vault_with(config());
        let alice = addr("alice");
        let router = addr("router");
        vault.deposit(&alice, 100, &alice).unwrap();
        let err = vault.redeem(&router, 50, &router, &alice).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

        vault.approve(&alice, &router, 60).unwrap();
        assert_eq!(vault.redeem(&router, 50, &router, &alice).unwrap(), 50);
        assert_eq!(vault.allowance(&alice, &router).unwrap(), 10);
    }

    #[test]
    fn paused_vault_blocks_deposit_and_withdraw() {
        let (vault, _) = vault_with(config());
        let alice = addr("alice");
        vault.deposit(&alice, 100, &alice).unwrap();
        vault.pause(&addr("admin")).unwrap();
        assert_eq!(
            vault.deposit(&alice, 10, &alice).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            vault.redeem(&alice, 10, &alice, &alice).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(vault.max_redeem(&alice).unwrap(), 0);
        assert_eq!(vault.max_deposit().unwrap(), 0);
    }

    #[test]
    fn slippage_above_tolerance_rejects_whole_withdrawal() {
        let (vault, _) = vault_with(config());
        let admin = addr("admin");
        let alice = addr("alice");
        let strategy = Arc::new(MockStrategy::new("USDC"));
        strategy.set_withdraw_fee_bps(500);
        vault.add_strategy(&admin, strategy.clone(), 10_000, 10_000).unwrap();
        vault.deposit(&alice, 10_000, &alice).unwrap();
        vault.rebalance(&admin).unwrap();
        assert_eq!(strategy.held(), 10_000);
        vault.drain_events().unwrap();

        let err = vault.withdraw(&alice, 5_000, &alice, &alice).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlippageExceeded);
        assert_eq!(vault.balance_of(&alice).unwrap(), 10_000);
        let events = vault.drain_events().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e.event, VaultEvent::SlippageProtectionTriggered { .. })));
        assert!(!events.iter().any(|e| matches!(e.event, VaultEvent::Withdraw { .. })));
    }

    #[test]
    fn slippage_within_tolerance_settles() {
        let (vault, _) = vault_with(config());
        let admin = addr("admin");
        let alice = addr("alice");
        let strategy = Arc::new(MockStrategy::new("USDC"));
        strategy.set_withdraw_fee_bps(50);
        vault.add_strategy(&admin, strategy, 10_000, 10_000).unwrap();
        vault.deposit(&alice, 10_000, &alice).unwrap();
        vault.rebalance(&admin).unwrap();

        let paid = vault.redeem(&alice, 2_000, &alice, &alice).unwrap();
        assert!(paid < 2_000);
        assert!(paid >= 1_980);
    }

    #[test]
    fn emergency_withdraw_only_in_shutdown() {
        let (vault, _) = vault_with(config());
        let admin = addr("admin");
        let alice = addr("alice");
        vault.deposit(&alice, 500, &alice).unwrap();
        assert_eq!(
            vault.emergency_withdraw(&alice, 100).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        vault.activate_shutdown(&admin).unwrap();
        assert_eq!(vault.emergency_withdraw(&alice, 500).unwrap(), 500);
        assert_eq!(vault.total_supply().unwrap(), 0);
    }

    #[test]
    fn emergency_exits_share_reachable_cash_pro_rata() {
        let (vault, _) = vault_with(config());
        let admin = addr("admin");
        let alice = addr("alice");
        let bob = addr("bob");
        let strategy = Arc::new(MockStrategy::new("USDC"));
        vault.add_strategy(&admin, strategy.clone(), 5_000, 50).unwrap();
        vault.deposit(&alice, 5_000, &alice).unwrap();
        vault.deposit(&bob, 5_000, &bob).unwrap();
        vault.rebalance(&admin).unwrap();
        assert_eq!(strategy.held(), 5_000);
        assert_eq!(vault.idle().unwrap(), 5_000);

        strategy.set_failing(true);
        vault.activate_shutdown(&admin).unwrap();
        assert_eq!(vault.emergency_withdraw(&alice, 5_000).unwrap(), 2_500);
        assert_eq!(vault.emergency_withdraw(&bob, 5_000).unwrap(), 2_500);
        assert_eq!(vault.total_supply().unwrap(), 0);
    }

    #[test]
    fn emergency_exit_unwinds_live_strategies() {
        let (vault, _) = vault_with(config());
        let admin = addr("admin");
        let alice = addr("alice");
        let strategy = Arc::new(MockStrategy::new("USDC"));
        vault.add_strategy(&admin, strategy.clone(), 10_000, 50).unwrap();
        vault.deposit(&alice, 4_000, &alice).unwrap();
        vault.rebalance(&admin).unwrap();
        assert_eq!(vault.idle().unwrap(), 0);

        vault.activate_shutdown(&admin).unwrap();
        assert_eq!(vault.emergency_withdraw(&alice, 1_000).unwrap(), 1_000);
        assert_eq!(strategy.held(), 0);
        assert_eq!(vault.idle().unwrap(), 3_000);
        assert!(vault
            .drain_events()
            .unwrap()
            .iter()
            .any(|r| matches!(r.event, VaultEvent::StrategyUnwound { recovered: 4_000, .. })));
    }

    #[test]
    fn deposit_at_threshold_stays_idle() {
        let (vault, _) = vault_with(config());
        let admin = addr("admin");
        let alice = addr("alice");
        let strategy = Arc::new(MockStrategy::new("USDC"));
        vault.add_strategy(&admin, strategy.clone(), 10_000, 50).unwrap();
        vault.deposit(&alice, 10_000, &alice).unwrap();
        vault.rebalance(&admin).unwrap();
        assert_eq!(strategy.held(), 10_000);

        // exactly 5% of total assets
        vault.deposit(&alice, 500, &alice).unwrap();
        assert_eq!(strategy.held(), 10_000);
        assert_eq!(vault.idle().unwrap(), 500);

        // 5% of 10_500 is 525; one more triggers a deploy of a quarter of idle
        vault.deposit(&alice, 526, &alice).unwrap();
        assert_eq!(strategy.held(), 10_256);
        assert_eq!(vault.idle().unwrap(), 770);
    }

    #[test]
    fn large_deposit_deploys_at_most_a_quarter_of_idle() {
        let (vault, _) = vault_with(config());
        let admin = addr("admin");
        let alice = addr("alice");
        let strategy = Arc::new(MockStrategy::new("USDC"));
        vault.add_strategy(&admin, strategy.clone(), 10_000, 50).unwrap();

        // empty vault: any deposit is large
        vault.deposit(&alice, 10_000, &alice).unwrap();
        assert_eq!(strategy.held(), 2_500);
        assert_eq!(vault.idle().unwrap(), 7_500);

        // idle 11_500 after the deposit, target gap 11_500: budget wins
        vault.deposit(&alice, 4_000, &alice).unwrap();
        assert_eq!(strategy.held(), 2_500 + 2_875);
        assert_eq!(vault.total_assets().unwrap(), 14_000);
    }

    #[test]
    fn transfer_moves_shares_without_assets() {
        let (vault, _) = vault_with(config());
        let alice = addr("alice");
        let bob = addr("bob");
        vault.deposit(&alice, 300, &alice).unwrap();
        vault.transfer_shares(&alice, &bob, 100).unwrap();
        assert_eq!(vault.balance_of(&bob).unwrap(), 100);
        assert_eq!(vault.total_assets().unwrap(), 300);
        assert_eq!(vault.total_supply().unwrap(), 300);
    }

    #[test]
    fn previews_include_pending_management_fee() {
        let mut cfg = config();
        cfg.management_fee_bps = 200;
        let clock = Arc::new(ManualClock::new(0));
        let vault = VaultBuilder::new(cfg, addr("admin"))
            .clock(clock.clone())
            .fee_recipient(addr("treasury"))
            .build()
            .unwrap();
        let alice = addr("alice");
        vault.deposit(&alice, 1_000_000, &alice).unwrap();
        clock.advance(crate::config::SECONDS_PER_YEAR);

        let preview = vault.preview_deposit(10_000).unwrap();
        assert!(preview > 10_000);
        assert_eq!(vault.deposit(&alice, 10_000, &alice).unwrap(), preview);
        assert!(vault.balance_of(&addr("treasury")).unwrap() > 0);
    }
}
