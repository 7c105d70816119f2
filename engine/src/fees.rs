//! # Fee Accrual
//!
//! Two fees, both paid by minting shares to the fee recipient so the cost
//! is spread across all holders through dilution instead of moving assets:
//!
//! ```text
//! management  = total_assets * mgmt_bps * Δt / (10_000 * SECONDS_PER_YEAR)
//! performance = harvested * perf_bps / 10_000
//! ```
//!
//! A fee worth `F` assets is turned into shares at the post-fee rate,
//! `F * (supply + 10^offset) / (total_assets - F + 1)`, so the recipient
//! ends up owning exactly `F` worth of the vault.
//!
//! Management accrual is time-based and consumes its basis atomically: the
//! collection timestamp only moves when shares are actually minted (or when
//! there is nothing to charge), so calling it twice at the same instant
//! charges once. A fee that rounds to zero leaves the timestamp alone and
//! keeps accruing. A zero rate accrues nothing, and a rate change restarts
//! the period, so a new rate never reaches back before it was set.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{MAX_BPS, MAX_MANAGEMENT_FEE_BPS, MAX_PERFORMANCE_FEE_BPS, SECONDS_PER_YEAR};
use crate::ledger::{mul_div, LedgerError, Rounding};
use crate::types::Address;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeError {
    #[error("management fee {0} bps above maximum {MAX_MANAGEMENT_FEE_BPS}")]
    ManagementFeeTooHigh(u64),

    #[error("performance fee {0} bps above maximum {MAX_PERFORMANCE_FEE_BPS}")]
    PerformanceFeeTooHigh(u64),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Persistent fee bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeState {
    pub recipient: Option<Address>,
    pub management_fee_bps: u64,
    pub performance_fee_bps: u64,
    pub last_collection: u64,
    /// Lifetime management fee, in assets.
    pub cumulative_management: u64,
    /// Lifetime performance fee, in assets.
    pub cumulative_performance: u64,
    pub cumulative_management_shares: u64,
    pub cumulative_performance_shares: u64,
}

/// Fee shares to mint, computed without touching state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeQuote {
    /// Fee value in assets.
    pub assets: u64,
    pub shares: u64,
}

impl FeeQuote {
    pub fn is_zero(&self) -> bool {
        self.shares == 0
    }
}

/// Converts a fee worth `fee_assets` into shares at the post-fee rate.
pub fn fee_to_shares(
    fee_assets: u64,
    total_assets: u64,
    total_supply: u64,
    virtual_shares: u128,
) -> Result<u64, LedgerError> {
    if fee_assets == 0 || fee_assets > total_assets {
        return Ok(0);
    }
    let share_base = total_supply as u128 + virtual_shares;
    let asset_base = (total_assets - fee_assets) as u128 + 1;
    mul_div(fee_assets, share_base, asset_base, Rounding::Down)
}

#[derive(Debug, Clone)]
pub struct FeeAccrual {
    state: FeeState,
}

impl FeeAccrual {
    pub fn new(
        management_fee_bps: u64,
        performance_fee_bps: u64,
        recipient: Option<Address>,
        now: u64,
    ) -> Result<Self, FeeError> {
        validate_fees(management_fee_bps, performance_fee_bps)?;
        Ok(Self {
            state: FeeState {
                recipient,
                management_fee_bps,
                performance_fee_bps,
                last_collection: now,
                cumulative_management: 0,
                cumulative_performance: 0,
                cumulative_management_shares: 0,
                cumulative_performance_shares: 0,
            },
        })
    }

    pub fn from_state(state: FeeState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &FeeState {
        &self.state
    }

    pub fn recipient(&self) -> Option<&Address> {
        self.state.recipient.as_ref()
    }

    pub fn set_recipient(&mut self, recipient: Address) {
        self.state.recipient = Some(recipient);
    }

    /// Changes both rates and restarts the management period at `now`.
    /// Callers settle the old rate first.
    pub fn set_fees(
        &mut self,
        management_fee_bps: u64,
        performance_fee_bps: u64,
        now: u64,
    ) -> Result<(), FeeError> {
        validate_fees(management_fee_bps, performance_fee_bps)?;
        self.state.management_fee_bps = management_fee_bps;
        self.state.performance_fee_bps = performance_fee_bps;
        self.state.last_collection = now;
        Ok(())
    }

    /// Management fee accrued since the last collection, in assets.
    pub fn pending_management_assets(&self, total_assets: u64, now: u64) -> Result<u64, FeeError> {
        let elapsed = now.saturating_sub(self.state.last_collection);
        if elapsed == 0 || self.state.management_fee_bps == 0 {
            return Ok(0);
        }
        let rate = self.state.management_fee_bps as u128 * elapsed as u128;
        let denom = MAX_BPS as u128 * SECONDS_PER_YEAR as u128;
        let fee = mul_div(total_assets, rate, denom, Rounding::Down)?;
        Ok(fee.min(total_assets))
    }

    /// What [`Self::collect_management`] would mint right now.
    pub fn quote_management(
        &self,
        total_assets: u64,
        total_supply: u64,
        virtual_shares: u128,
        now: u64,
    ) -> Result<FeeQuote, FeeError> {
        if self.state.recipient.is_none() || total_supply == 0 {
            return Ok(FeeQuote::default());
        }
        let assets = self.pending_management_assets(total_assets, now)?;
        let shares = fee_to_shares(assets, total_assets, total_supply, virtual_shares)?;
        Ok(FeeQuote { assets, shares })
    }

    /// Consumes the management basis. The caller mints `quote.shares` to
    /// the recipient and must call this only after the mint succeeded.
    pub fn collect_management(
        &mut self,
        total_assets: u64,
        total_supply: u64,
        virtual_shares: u128,
        now: u64,
    ) -> Result<Option<(Address, FeeQuote)>, FeeError> {
        let quote = self.quote_management(total_assets, total_supply, virtual_shares, now)?;
        let Some(recipient) = self.state.recipient.clone() else {
            self.state.last_collection = now;
            return Ok(None);
        };
        if self.state.management_fee_bps == 0 || total_supply == 0 || total_assets == 0 {
            // nothing to charge; restart the period
            self.state.last_collection = now;
            return Ok(None);
        }
        if quote.is_zero() {
            return Ok(None);
        }
        Ok(Some((recipient, quote)))
    }

    /// Records a minted management fee and resets the period.
    pub fn record_management(&mut self, quote: FeeQuote, now: u64) {
        self.state.last_collection = now;
        self.state.cumulative_management = self.state.cumulative_management.saturating_add(quote.assets);
        self.state.cumulative_management_shares = self
            .state
            .cumulative_management_shares
            .saturating_add(quote.shares);
    }

    /// Performance fee on a realized harvest. `total_assets` already
    /// includes the harvested amount.
    pub fn quote_performance(
        &self,
        harvested: u64,
        total_assets: u64,
        total_supply: u64,
        virtual_shares: u128,
    ) -> Result<FeeQuote, FeeError> {
        if self.state.recipient.is_none() || harvested == 0 || self.state.performance_fee_bps == 0 {
            return Ok(FeeQuote::default());
        }
        let assets = mul_div(
            harvested,
            self.state.performance_fee_bps as u128,
            MAX_BPS as u128,
            Rounding::Down,
        )?;
        let shares = fee_to_shares(assets, total_assets, total_supply, virtual_shares)?;
        Ok(FeeQuote { assets, shares })
    }

    pub fn record_performance(&mut self, quote: FeeQuote) {
        self.state.cumulative_performance = self.state.cumulative_performance.saturating_add(quote.assets);
        self.state.cumulative_performance_shares = self
            .state
            .cumulative_performance_shares
            .saturating_add(quote.shares);
    }
}

fn validate_fees(management_fee_bps: u64, performance_fee_bps: u64) -> Result<(), FeeError> {
    if management_fee_bps > MAX_MANAGEMENT_FEE_BPS {
        return Err(FeeError::ManagementFeeTooHigh(management_fee_bps));
    }
    if performance_fee_bps > MAX_PERFORMANCE_FEE_BPS {
        return Err(FeeError::PerformanceFeeTooHigh(performance_fee_bps));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> Address {
        Address::parse("treasury").unwrap()
    }

    #[test]
    fn management_fee_for_one_year() {
        let fees = FeeAccrual::new(200, 1_000, Some(recipient()), 0).unwrap();
        let pending = fees
            .pending_management_assets(1_000_000, SECONDS_PER_YEAR)
            .unwrap();
        assert_eq!(pending, 20_000);
    }

    #[test]
    fn fee_shares_are_worth_the_fee() {
        // 1_000_000 assets, 1_000_000 shares, 20_000 fee
        let shares = fee_to_shares(20_000, 1_000_000, 1_000_000, 1).unwrap();
        // 20_000 * 1_000_001 / 980_001
        assert_eq!(shares, 20_408);
        let supply = 1_000_000u128 + shares as u128;
        let worth = shares as u128 * 1_000_001 / (supply + 1);
        assert!(worth <= 20_000);
        assert!(worth >= 19_999);
    }

    #[test]
    fn collecting_twice_at_same_instant_charges_once() {
        let mut fees = FeeAccrual::new(200, 0, Some(recipient()), 0).unwrap();
        let now = SECONDS_PER_YEAR / 2;

        let (_, quote) = fees.collect_management(1_000_000, 1_000_000, 1, now).unwrap().unwrap();
        assert_eq!(quote.assets, 10_000);
        fees.record_management(quote, now);

        assert!(fees.collect_management(1_000_000, 1_000_000, 1, now).unwrap().is_none());
        assert_eq!(fees.state().cumulative_management, 10_000);
    }

    #[test]
    fn timestamp_not_reset_without_mint() {
        let mut fees = FeeAccrual::new(200, 0, Some(recipient()), 0).unwrap();
        // one second on a tiny vault rounds to zero
        assert!(fees.collect_management(1_000, 1_000, 1, 1).unwrap().is_none());
        assert_eq!(fees.state().last_collection, 0);
    }

    #[test]
    fn empty_vault_restarts_period() {
        let mut fees = FeeAccrual::new(200, 0, Some(recipient()), 0).unwrap();
        assert!(fees.collect_management(0, 0, 1, 500).unwrap().is_none());
        assert_eq!(fees.state().last_collection, 500);
    }

    #[test]
    fn performance_fee_only_on_harvest() {
        let fees = FeeAccrual::new(0, 1_000, Some(recipient()), 0).unwrap();
        let quote = fees.quote_performance(500, 10_500, 10_000, 1).unwrap();
        assert_eq!(quote.assets, 50);
        assert!(quote.shares > 0);
        assert!(fees.quote_performance(0, 10_500, 10_000, 1).unwrap().is_zero());
    }

    #[test]
    fn fee_bounds_enforced() {
        assert_eq!(
            FeeAccrual::new(MAX_MANAGEMENT_FEE_BPS + 1, 0, None, 0).unwrap_err(),
            FeeError::ManagementFeeTooHigh(MAX_MANAGEMENT_FEE_BPS + 1)
        );
        let mut fees = FeeAccrual::new(0, 0, None, 0).unwrap();
        assert!(fees.set_fees(0, MAX_PERFORMANCE_FEE_BPS + 1, 0).is_err());
    }

    #[test]
    fn zero_rate_does_not_bank_time() {
        let mut fees = FeeAccrual::new(0, 0, Some(recipient()), 0).unwrap();
        assert!(fees
            .collect_management(1_000_000, 1_000_000, 1, SECONDS_PER_YEAR)
            .unwrap()
            .is_none());
        assert_eq!(fees.state().last_collection, SECONDS_PER_YEAR);

        fees.set_fees(200, 0, SECONDS_PER_YEAR).unwrap();
        assert!(fees
            .collect_management(1_000_000, 1_000_000, 1, SECONDS_PER_YEAR)
            .unwrap()
            .is_none());
    }

    #[test]
    fn rate_change_restarts_period() {
        let mut fees = FeeAccrual::new(0, 0, Some(recipient()), 0).unwrap();
        fees.set_fees(200, 0, SECONDS_PER_YEAR).unwrap();
        assert_eq!(
            fees.pending_management_assets(1_000_000, SECONDS_PER_YEAR)
                .unwrap(),
            0
        );
        assert_eq!(
            fees.pending_management_assets(1_000_000, SECONDS_PER_YEAR * 3 / 2)
                .unwrap(),
            10_000
        );
    }
}
