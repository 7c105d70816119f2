//! # Simulated Strategies
//!
//! [`SimulatedStrategy`] is an in-memory yield source that accrues simple
//! interest off the vault clock and can be told to fail, panic, charge a
//! withdrawal fee, cap its liquidity or lose principal. [`ReentrantStrategy`]
//! calls back into its vault from inside `invest` to exercise the
//! reentrancy guard.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use meridian_engine::config::{MAX_BPS, SECONDS_PER_YEAR};
use meridian_engine::error::ErrorKind;
use meridian_engine::ledger::bps_of;
use meridian_engine::strategy::{Strategy, StrategyError};
use meridian_engine::types::{Address, AssetId, Clock};
use meridian_engine::Vault;

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Static parameters of a simulated strategy, as found in node config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyProfile {
    pub name: String,
    /// Simple annual yield.
    pub apy_bps: u64,
    /// Haircut charged on every regular withdrawal.
    #[serde(default)]
    pub withdraw_fee_bps: u64,
    /// Largest share of the position one `withdraw` call can return.
    #[serde(default = "full_liquidity")]
    pub liquidity_bps: u64,
}

fn full_liquidity() -> u64 {
    MAX_BPS
}

impl StrategyProfile {
    pub fn new(name: &str, apy_bps: u64) -> Self {
        Self {
            name: name.to_string(),
            apy_bps,
            withdraw_fee_bps: 0,
            liquidity_bps: MAX_BPS,
        }
    }
}

/// Strategy calls that can be made to misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    TotalAssets,
    Apy,
    Invest,
    Withdraw,
    Harvest,
    EmergencyWithdraw,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::TotalAssets => "total_assets",
            Op::Apy => "apy",
            Op::Invest => "invest",
            Op::Withdraw => "withdraw",
            Op::Harvest => "harvest",
            Op::EmergencyWithdraw => "emergency_withdraw",
        }
    }
}

// ---------------------------------------------------------------------------
// SimulatedStrategy
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Position {
    principal: u64,
    /// Accrued, not yet harvested.
    pending_yield: u64,
    last_accrual: u64,
    failing: BTreeSet<Op>,
    panicking: BTreeSet<Op>,
    paused: bool,
    calls: u64,
}

pub struct SimulatedStrategy {
    asset: AssetId,
    profile: StrategyProfile,
    clock: Arc<dyn Clock>,
    position: Mutex<Position>,
}

impl std::fmt::Debug for SimulatedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedStrategy")
            .field("asset", &self.asset)
            .field("profile", &self.profile)
            .field("position", &*self.position.lock())
            .finish()
    }
}

impl SimulatedStrategy {
    pub fn new(asset: AssetId, profile: StrategyProfile, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            asset,
            profile,
            clock,
            position: Mutex::new(Position {
                last_accrual: now,
                ..Position::default()
            }),
        }
    }

    pub fn profile(&self) -> &StrategyProfile {
        &self.profile
    }

    /// Principal plus accrued yield, without failure injection.
    pub fn holdings(&self) -> u64 {
        let mut p = self.position.lock();
        self.accrue(&mut p);
        p.principal.saturating_add(p.pending_yield)
    }

    /// Number of trait calls received.
    pub fn calls(&self) -> u64 {
        self.position.lock().calls
    }

    /// Makes `op` return an error until [`heal`](Self::heal).
    pub fn fail(&self, op: Op) {
        self.position.lock().failing.insert(op);
    }

    /// Makes every call fail.
    pub fn fail_all(&self) {
        let mut p = self.position.lock();
        p.failing.extend([
            Op::TotalAssets,
            Op::Apy,
            Op::Invest,
            Op::Withdraw,
            Op::Harvest,
            Op::EmergencyWithdraw,
        ]);
    }

    /// Makes `op` panic.
    pub fn panic_on(&self, op: Op) {
        self.position.lock().panicking.insert(op);
    }

    pub fn heal(&self) {
        let mut p = self.position.lock();
        p.failing.clear();
        p.panicking.clear();
    }

    /// Switches the strategy off on its side; it refuses new capital.
    pub fn set_paused(&self, paused: bool) {
        self.position.lock().paused = paused;
    }

    /// Removes `amount` of principal, as an exploit or bad trade would.
    pub fn lose(&self, amount: u64) {
        let mut p = self.position.lock();
        p.principal = p.principal.saturating_sub(amount);
    }

    /// Adds unrealized yield that `harvest` will hand over.
    pub fn add_yield(&self, amount: u64) {
        let mut p = self.position.lock();
        p.pending_yield = p.pending_yield.saturating_add(amount);
    }

    fn accrue(&self, p: &mut Position) {
        let now = self.clock.now();
        let elapsed = now.saturating_sub(p.last_accrual);
        if elapsed == 0 || p.principal == 0 {
            p.last_accrual = now.max(p.last_accrual);
            return;
        }
        let gained = p.principal as u128 * self.profile.apy_bps as u128 * elapsed as u128
            / (MAX_BPS as u128 * SECONDS_PER_YEAR as u128);
        p.pending_yield = p
            .pending_yield
            .saturating_add(u64::try_from(gained).unwrap_or(u64::MAX));
        p.last_accrual = now;
    }

    /// Opens a call: counts it, applies injected faults, accrues yield.
    fn enter(&self, op: Op) -> Result<parking_lot::MutexGuard<'_, Position>, StrategyError> {
        let mut p = self.position.lock();
        p.calls += 1;
        if p.panicking.contains(&op) {
            drop(p);
            panic!("simulated panic in {}", op.name());
        }
        if p.failing.contains(&op) {
            return Err(StrategyError::reverted(op.name(), "injected failure"));
        }
        self.accrue(&mut p);
        Ok(p)
    }
}

impl Strategy for SimulatedStrategy {
    fn name(&self) -> String {
        self.profile.name.clone()
    }

    fn asset(&self) -> AssetId {
        self.asset.clone()
    }

    fn total_assets(&self) -> Result<u64, StrategyError> {
        let p = self.enter(Op::TotalAssets)?;
        Ok(p.principal.saturating_add(p.pending_yield))
    }

    fn apy_bps(&self) -> Result<u64, StrategyError> {
        self.enter(Op::Apy)?;
        Ok(self.profile.apy_bps)
    }

    fn invest(&self, amount: u64) -> Result<u64, StrategyError> {
        let mut p = self.enter(Op::Invest)?;
        if p.paused {
            return Err(StrategyError::Inactive);
        }
        p.principal = p
            .principal
            .checked_add(amount)
            .ok_or_else(|| StrategyError::reverted("invest", "position overflow"))?;
        Ok(amount)
    }

    fn withdraw(&self, amount: u64) -> Result<u64, StrategyError> {
        let mut p = self.enter(Op::Withdraw)?;
        let position = p.principal.saturating_add(p.pending_yield);
        let liquid = bps_of(position, self.profile.liquidity_bps);
        let taken = amount.min(liquid);
        let from_principal = taken.min(p.principal);
        p.principal -= from_principal;
        p.pending_yield -= taken - from_principal;
        Ok(taken - bps_of(taken, self.profile.withdraw_fee_bps))
    }

    fn harvest(&self) -> Result<u64, StrategyError> {
        let mut p = self.enter(Op::Harvest)?;
        Ok(std::mem::take(&mut p.pending_yield))
    }

    fn emergency_withdraw(&self) -> Result<u64, StrategyError> {
        let mut p = self.enter(Op::EmergencyWithdraw)?;
        let all = p.principal.saturating_add(p.pending_yield);
        p.principal = 0;
        p.pending_yield = 0;
        Ok(all)
    }

    fn is_active(&self) -> bool {
        let p = self.position.lock();
        !p.paused && !p.failing.contains(&Op::Invest)
    }
}

// ---------------------------------------------------------------------------
// ReentrantStrategy
// ---------------------------------------------------------------------------

/// Holds funds like a plain strategy, but on `invest` and `withdraw` first
/// tries to deposit into its own vault. The vault must refuse.
#[derive(Debug)]
pub struct ReentrantStrategy {
    asset: AssetId,
    attacker: Address,
    vault: Mutex<Option<Weak<Vault>>>,
    held: Mutex<u64>,
    observed: Mutex<Vec<ErrorKind>>,
}

impl ReentrantStrategy {
    pub fn new(asset: AssetId, attacker: Address) -> Self {
        Self {
            asset,
            attacker,
            vault: Mutex::new(None),
            held: Mutex::new(0),
            observed: Mutex::new(Vec::new()),
        }
    }

    /// Points the strategy at the vault it will call back into.
    pub fn arm(&self, vault: &Arc<Vault>) {
        *self.vault.lock() = Some(Arc::downgrade(vault));
    }

    /// Error kinds the vault answered the callbacks with.
    pub fn observed(&self) -> Vec<ErrorKind> {
        self.observed.lock().clone()
    }

    fn call_back(&self) {
        let vault = self.vault.lock().as_ref().and_then(Weak::upgrade);
        if let Some(vault) = vault {
            let kind = match vault.deposit(&self.attacker, 1, &self.attacker) {
                Ok(_) => None,
                Err(e) => Some(e.kind()),
            };
            if let Some(kind) = kind {
                self.observed.lock().push(kind);
            }
        }
    }
}

impl Strategy for ReentrantStrategy {
    fn name(&self) -> String {
        "reentrant".to_string()
    }

    fn asset(&self) -> AssetId {
        self.asset.clone()
    }

    fn total_assets(&self) -> Result<u64, StrategyError> {
        Ok(*self.held.lock())
    }

    fn apy_bps(&self) -> Result<u64, StrategyError> {
        Ok(0)
    }

    fn invest(&self, amount: u64) -> Result<u64, StrategyError> {
        self.call_back();
        *self.held.lock() += amount;
        Ok(amount)
    }

    fn withdraw(&self, amount: u64) -> Result<u64, StrategyError> {
        self.call_back();
        let mut held = self.held.lock();
        let taken = amount.min(*held);
        *held -= taken;
        Ok(taken)
    }

    fn harvest(&self) -> Result<u64, StrategyError> {
        Ok(0)
    }

    fn emergency_withdraw(&self) -> Result<u64, StrategyError> {
        Ok(std::mem::take(&mut *self.held.lock()))
    }

    fn is_active(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use meridian_engine::types::ManualClock;

    use super::*;

    fn strategy(profile: StrategyProfile) -> (SimulatedStrategy, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (
            SimulatedStrategy::new(AssetId::new("USDC"), profile, clock.clone()),
            clock,
        )
    }

    #[test]
    fn yield_accrues_with_time() {
        let (s, clock) = strategy(StrategyProfile::new("lend", 1_000));
        s.invest(1_000_000).unwrap();
        clock.advance(SECONDS_PER_YEAR);
        assert_eq!(s.total_assets().unwrap(), 1_100_000);
        assert_eq!(s.harvest().unwrap(), 100_000);
        assert_eq!(s.total_assets().unwrap(), 1_000_000);
    }

    #[test]
    fn liquidity_cap_and_fee_apply() {
        let mut profile = StrategyProfile::new("lp", 0);
        profile.liquidity_bps = 5_000;
        profile.withdraw_fee_bps = 100;
        let (s, _) = strategy(profile);
        s.invest(1_000).unwrap();
        assert_eq!(s.withdraw(800).unwrap(), 495);
        assert_eq!(s.holdings(), 500);
    }

    #[test]
    fn injected_faults() {
        let (s, _) = strategy(StrategyProfile::new("x", 0));
        s.fail(Op::Harvest);
        assert!(s.harvest().is_err());
        assert!(s.invest(10).is_ok());
        s.fail(Op::Invest);
        assert!(!s.is_active());
        s.heal();
        assert!(s.is_active());
        assert_eq!(s.emergency_withdraw().unwrap(), 10);
    }

    #[test]
    fn profile_defaults_from_json() {
        let p: StrategyProfile = serde_json::from_str(r#"{"name":"aave","apy_bps":420}"#).unwrap();
        assert_eq!(p.liquidity_bps, MAX_BPS);
        assert_eq!(p.withdraw_fee_bps, 0);
    }
}
