//! # Strategies: External Yield Sources
//!
//! A strategy is anything that can take the vault's asset and give it back
//! later with yield: a lending market, an LP position, a staking adapter.
//! The engine never looks inside one. It talks to strategies only through
//! the narrow [`Strategy`] trait and treats every call as untrusted: the
//! call may fail, lie about amounts, panic, or try to call back into the
//! vault. [`guarded_call`] turns all of those into a [`StrategyError`] so a
//! broken strategy degrades to "no state change" instead of corrupting the
//! books.
//!
//! ```text
//! mod.rs:        Strategy trait, StrategyError, guarded_call
//! slot.rs:       StrategySlot: per-strategy bookkeeping
//! allocator.rs:  StrategyAllocator: registry, allocations, bad debt
//! ```

pub mod allocator;
pub mod slot;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AssetId;

pub use allocator::{AllocationChange, AllocatorError, BadDebt, Removal, StrategyAllocator};
pub use slot::{SlotRecord, StrategySlot};

/// Stable identifier of a registered strategy slot. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrategyId(pub u32);

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "strategy-{}", self.0)
    }
}

/// Failure of a call into an external strategy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    /// The strategy rejected or reverted the call.
    #[error("strategy call `{op}` reverted: {reason}")]
    Reverted { op: &'static str, reason: String },

    /// The strategy reported an amount it cannot have produced
    /// (e.g. invested more than it was given).
    #[error("strategy call `{op}` misreported amount: requested {requested}, reported {reported}")]
    Misreported {
        op: &'static str,
        requested: u64,
        reported: u64,
    },

    /// The strategy panicked inside the call.
    #[error("strategy call `{op}` panicked")]
    Panicked { op: &'static str },

    /// The strategy is switched off on its side.
    #[error("strategy is inactive")]
    Inactive,
}

impl StrategyError {
    /// Shorthand for implementations reporting a revert.
    pub fn reverted(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Reverted {
            op,
            reason: reason.into(),
        }
    }
}

/// The collaborator contract every yield source implements.
///
/// Amounts are in the vault asset's smallest unit. `invest` and `withdraw`
/// move funds between the vault's idle cash and the strategy; `harvest`
/// realizes accrued yield and hands it to the vault. Methods take `&self`:
/// implementations own their interior mutability and must be shareable
/// across threads.
pub trait Strategy: Send + Sync {
    /// Human-readable name for logs and the API.
    fn name(&self) -> String;

    /// Asset the strategy accepts. Must match the vault's asset.
    fn asset(&self) -> AssetId;

    /// Current mark-to-market value of the vault's position.
    fn total_assets(&self) -> Result<u64, StrategyError>;

    /// Current APY in basis points.
    fn apy_bps(&self) -> Result<u64, StrategyError>;

    /// Takes up to `amount` from the vault; returns how much was invested.
    fn invest(&self, amount: u64) -> Result<u64, StrategyError>;

    /// Returns up to `amount` to the vault; returns how much arrived.
    fn withdraw(&self, amount: u64) -> Result<u64, StrategyError>;

    /// Realizes accrued yield; returns the amount handed to the vault.
    fn harvest(&self) -> Result<u64, StrategyError>;

    /// Unwinds the whole position, accepting any loss.
    fn emergency_withdraw(&self) -> Result<u64, StrategyError>;

    /// Whether the strategy currently accepts capital.
    fn is_active(&self) -> bool;
}

/// Runs one strategy call, converting a panic into [`StrategyError::Panicked`].
pub fn guarded_call<T>(
    op: &'static str,
    call: impl FnOnce() -> Result<T, StrategyError>,
) -> Result<T, StrategyError> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(op, "strategy call panicked");
            Err(StrategyError::Panicked { op })
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-crate strategy double for unit tests.

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct Inner {
        held: u64,
        pending_yield: u64,
        fail_all: bool,
        fail_valuation: bool,
        withdraw_fee_bps: u64,
        /// Claimed withdrawal proceeds are multiplied by this when above 1.
        withdraw_multiplier: u64,
    }

    /// A strategy that simply holds funds and can be told to misbehave.
    #[derive(Debug)]
    pub struct MockStrategy {
        asset: AssetId,
        inner: Mutex<Inner>,
    }

    impl MockStrategy {
        pub fn new(asset: &str) -> Self {
            Self {
                asset: AssetId::new(asset),
                inner: Mutex::new(Inner::default()),
            }
        }

        pub fn held(&self) -> u64 {
            self.inner.lock().held
        }

        /// Mark-to-market gain that `harvest` will realize.
        pub fn accrue_yield(&self, amount: u64) {
            self.inner.lock().pending_yield += amount;
        }

        /// Mark-to-market gain that stays in the position.
        pub fn grow(&self, amount: u64) {
            self.inner.lock().held += amount;
        }

        pub fn set_failing(&self, fail: bool) {
            self.inner.lock().fail_all = fail;
        }

        pub fn set_withdraw_fee_bps(&self, bps: u64) {
            self.inner.lock().withdraw_fee_bps = bps;
        }

        /// Only `total_assets` fails.
        pub fn set_valuation_failing(&self, fail: bool) {
            self.inner.lock().fail_valuation = fail;
        }

        pub fn set_withdraw_multiplier(&self, multiplier: u64) {
            self.inner.lock().withdraw_multiplier = multiplier;
        }

        fn check(&self, op: &'static str) -> Result<(), StrategyError> {
            if self.inner.lock().fail_all {
                return Err(StrategyError::reverted(op, "mock failure"));
            }
            Ok(())
        }
    }

    impl Strategy for MockStrategy {
        fn name(&self) -> String {
            "mock".to_string()
        }

        fn asset(&self) -> AssetId {
            self.asset.clone()
        }

        fn total_assets(&self) -> Result<u64, StrategyError> {
            self.check("total_assets")?;
            let inner = self.inner.lock();
            if inner.fail_valuation {
                return Err(StrategyError::reverted("total_assets", "oracle down"));
            }
            Ok(inner.held + inner.pending_yield)
        }

        fn apy_bps(&self) -> Result<u64, StrategyError> {
            self.check("apy")?;
            Ok(500)
        }

        fn invest(&self, amount: u64) -> Result<u64, StrategyError> {
            self.check("invest")?;
            self.inner.lock().held += amount;
            Ok(amount)
        }

        fn withdraw(&self, amount: u64) -> Result<u64, StrategyError> {
            self.check("withdraw")?;
            let mut inner = self.inner.lock();
            let taken = amount.min(inner.held);
            inner.held -= taken;
            let fee = crate::ledger::bps_of(taken, inner.withdraw_fee_bps);
            Ok((taken - fee) * inner.withdraw_multiplier.max(1))
        }

        fn harvest(&self) -> Result<u64, StrategyError> {
            self.check("harvest")?;
            let mut inner = self.inner.lock();
            Ok(std::mem::take(&mut inner.pending_yield))
        }

        fn emergency_withdraw(&self) -> Result<u64, StrategyError> {
            self.check("emergency_withdraw")?;
            let mut inner = self.inner.lock();
            let all = inner.held + inner.pending_yield;
            inner.held = 0;
            inner.pending_yield = 0;
            Ok(all)
        }

        fn is_active(&self) -> bool {
            !self.inner.lock().fail_all
        }
    }
}
