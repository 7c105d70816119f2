//! Share balances, total supply and spending allowances.
//!
//! Balances change only through [`ShareLedger::mint`] and
//! [`ShareLedger::burn`] (plus holder-to-holder transfers, which leave the
//! supply untouched), so `total_supply == Σ balances` holds after every call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::LedgerError;
use crate::types::Address;

/// Share ownership table of one vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLedger {
    balances: HashMap<Address, u64>,
    /// owner -> spender -> remaining shares.
    allowances: HashMap<Address, HashMap<Address, u64>>,
    total_supply: u64,
}

impl ShareLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_supply(&self) -> u64 {
        self.total_supply
    }

    pub fn balance_of(&self, holder: &Address) -> u64 {
        self.balances.get(holder).copied().unwrap_or(0)
    }

    /// Number of holders with a non-zero balance.
    pub fn holder_count(&self) -> usize {
        self.balances.values().filter(|b| **b > 0).count()
    }

    /// All non-zero balances, sorted by holder for stable output.
    pub fn holders(&self) -> Vec<(Address, u64)> {
        let mut out: Vec<_> = self
            .balances
            .iter()
            .filter(|(_, b)| **b > 0)
            .map(|(a, b)| (a.clone(), *b))
            .collect();
        out.sort();
        out
    }

    pub fn mint(&mut self, to: &Address, shares: u64) -> Result<(), LedgerError> {
        let supply = self
            .total_supply
            .checked_add(shares)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        let balance = self.balances.entry(to.clone()).or_insert(0);
        *balance = balance
            .checked_add(shares)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        self.total_supply = supply;
        Ok(())
    }

    pub fn burn(&mut self, from: &Address, shares: u64) -> Result<(), LedgerError> {
        let available = self.balance_of(from);
        if available < shares {
            return Err(LedgerError::InsufficientShares {
                holder: from.clone(),
                available,
                requested: shares,
            });
        }
        if available == shares {
            self.balances.remove(from);
        } else {
            self.balances.insert(from.clone(), available - shares);
        }
        self.total_supply -= shares;
        Ok(())
    }

    pub fn transfer(&mut self, from: &Address, to: &Address, shares: u64) -> Result<(), LedgerError> {
        if from == to {
            return Ok(());
        }
        self.burn(from, shares)?;
        self.mint(to, shares)
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> u64 {
        self.allowances
            .get(owner)
            .and_then(|m| m.get(spender))
            .copied()
            .unwrap_or(0)
    }

    pub fn approve(&mut self, owner: &Address, spender: &Address, shares: u64) {
        let per_owner = self.allowances.entry(owner.clone()).or_default();
        if shares == 0 {
            per_owner.remove(spender);
        } else {
            per_owner.insert(spender.clone(), shares);
        }
    }

    /// Consumes allowance when `spender` acts for `owner`. Acting on your
    /// own shares needs no allowance; `u64::MAX` is an unlimited approval.
    pub fn spend_allowance(
        &mut self,
        owner: &Address,
        spender: &Address,
        shares: u64,
    ) -> Result<(), LedgerError> {
        self.check_allowance(owner, spender, shares)?;
        let current = self.allowance(owner, spender);
        if owner == spender || current == u64::MAX {
            return Ok(());
        }
        self.approve(owner, spender, current - shares);
        Ok(())
    }

    /// Fails if `spender` may not move `shares` of `owner`'s balance.
    pub fn check_allowance(&self, owner: &Address, spender: &Address, shares: u64) -> Result<(), LedgerError> {
        if owner == spender {
            return Ok(());
        }
        let current = self.allowance(owner, spender);
        if current != u64::MAX && current < shares {
            return Err(LedgerError::InsufficientAllowance {
                owner: owner.clone(),
                spender: spender.clone(),
                allowed: current,
                requested: shares,
            });
        }
        Ok(())
    }

    /// `Σ balances`, used by invariant checks.
    pub fn sum_of_balances(&self) -> u128 {
        self.balances.values().map(|b| *b as u128).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn mint_and_burn_track_supply() {
        let mut ledger = ShareLedger::new();
        let alice = addr("alice");
        let bob = addr("bob");

        ledger.mint(&alice, 700).unwrap();
        ledger.mint(&bob, 300).unwrap();
        assert_eq!(ledger.total_supply(), 1_000);

        ledger.burn(&alice, 200).unwrap();
        assert_eq!(ledger.balance_of(&alice), 500);
        assert_eq!(ledger.total_supply(), 800);
        assert_eq!(ledger.sum_of_balances(), 800);
    }

    #[test]
    fn burning_more_than_balance_fails_without_effect() {
        let mut ledger = ShareLedger::new();
        let alice = addr("alice");
        ledger.mint(&alice, 10).unwrap();

        let err = ledger.burn(&alice, 11).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientShares {
                available: 10,
                requested: 11,
                ..
            }
        ));
        assert_eq!(ledger.balance_of(&alice), 10);
        assert_eq!(ledger.total_supply(), 10);
    }

    #[test]
    fn full_burn_removes_holder() {
        let mut ledger = ShareLedger::new();
        let alice = addr("alice");
        ledger.mint(&alice, 10).unwrap();
        ledger.burn(&alice, 10).unwrap();
        assert_eq!(ledger.holder_count(), 0);
        assert!(ledger.holders().is_empty());
    }

    #[test]
    fn mint_overflow_rejected() {
        let mut ledger = ShareLedger::new();
        let alice = addr("alice");
        ledger.mint(&alice, u64::MAX).unwrap();
        assert_eq!(
            ledger.mint(&addr("bob"), 1),
            Err(LedgerError::ArithmeticOverflow)
        );
        assert_eq!(ledger.balance_of(&addr("bob")), 0);
    }

    #[test]
    fn transfer_preserves_supply() {
        let mut ledger = ShareLedger::new();
        let alice = addr("alice");
        let bob = addr("bob");
        ledger.mint(&alice, 100).unwrap();
        ledger.transfer(&alice, &bob, 40).unwrap();
        assert_eq!(ledger.balance_of(&alice), 60);
        assert_eq!(ledger.balance_of(&bob), 40);
        assert_eq!(ledger.total_supply(), 100);
    }

    #[test]
    fn allowance_is_consumed() {
        let mut ledger = ShareLedger::new();
        let alice = addr("alice");
        let router = addr("router");

        ledger.approve(&alice, &router, 50);
        ledger.spend_allowance(&alice, &router, 30).unwrap();
        assert_eq!(ledger.allowance(&alice, &router), 20);

        let err = ledger.spend_allowance(&alice, &router, 21).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAllowance { allowed: 20, .. }));
    }

    #[test]
    fn unlimited_allowance_is_not_decremented() {
        let mut ledger = ShareLedger::new();
        let alice = addr("alice");
        let router = addr("router");
        ledger.approve(&alice, &router, u64::MAX);
        ledger.spend_allowance(&alice, &router, 1_000).unwrap();
        assert_eq!(ledger.allowance(&alice, &router), u64::MAX);
    }

    #[test]
    fn owner_needs_no_allowance() {
        let mut ledger = ShareLedger::new();
        let alice = addr("alice");
        assert!(ledger.spend_allowance(&alice, &alice, 999).is_ok());
    }

    #[test]
    fn ledger_json_roundtrip() {
        let mut ledger = ShareLedger::new();
        ledger.mint(&addr("alice"), 5).unwrap();
        ledger.approve(&addr("alice"), &addr("bob"), 3);
        let json = serde_json::to_string(&ledger).unwrap();
        let back: ShareLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(back.balance_of(&addr("alice")), 5);
        assert_eq!(back.allowance(&addr("alice"), &addr("bob")), 3);
    }
}
