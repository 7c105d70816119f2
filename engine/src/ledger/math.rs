//! Share/asset conversion.
//!
//! The exchange rate is `(total_assets + 1) / (total_supply + 10^offset)`.
//! Offsetting both sides keeps the empty vault well defined and makes the
//! classic donation ("inflation") attack on the first depositor
//! unprofitable: the attacker has to donate roughly `10^offset` times the
//! amount they hope to steal.
//!
//! Every conversion takes an explicit [`Rounding`]. Callers pick the
//! direction that favors the vault: round down when handing out shares or
//! assets, round up when asking the user for them.

use serde::{Deserialize, Serialize};

use super::LedgerError;

/// Rounding direction of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rounding {
    Down,
    Up,
}

/// `a * b / denominator` with a `u128` intermediate.
pub fn mul_div(a: u64, b: u128, denominator: u128, rounding: Rounding) -> Result<u64, LedgerError> {
    if denominator == 0 {
        return Err(LedgerError::DivisionByZero);
    }
    let product = (a as u128)
        .checked_mul(b)
        .ok_or(LedgerError::ArithmeticOverflow)?;
    let mut quotient = product / denominator;
    if rounding == Rounding::Up && product % denominator != 0 {
        quotient += 1;
    }
    u64::try_from(quotient).map_err(|_| LedgerError::ArithmeticOverflow)
}

/// `amount * bps / 10_000`, rounded down.
pub fn bps_of(amount: u64, bps: u64) -> u64 {
    ((amount as u128 * bps as u128) / crate::config::MAX_BPS as u128) as u64
}

/// A frozen view of the vault totals used for one conversion round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub total_assets: u64,
    pub total_supply: u64,
    /// `10^decimals_offset`.
    pub virtual_shares: u128,
}

impl ExchangeRate {
    pub fn new(total_assets: u64, total_supply: u64, virtual_shares: u128) -> Self {
        Self {
            total_assets,
            total_supply,
            virtual_shares,
        }
    }

    fn share_base(&self) -> u128 {
        self.total_supply as u128 + self.virtual_shares
    }

    fn asset_base(&self) -> u128 {
        self.total_assets as u128 + 1
    }

    /// Shares worth `assets`.
    pub fn to_shares(&self, assets: u64, rounding: Rounding) -> Result<u64, LedgerError> {
        mul_div(assets, self.share_base(), self.asset_base(), rounding)
    }

    /// Assets worth `shares`.
    pub fn to_assets(&self, shares: u64, rounding: Rounding) -> Result<u64, LedgerError> {
        mul_div(shares, self.asset_base(), self.share_base(), rounding)
    }

    /// Assets per `10^offset` shares scaled by 1e6, for display and metrics.
    pub fn price_micros(&self) -> u64 {
        let scaled = self.asset_base() * 1_000_000 * self.virtual_shares / self.share_base();
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }
}
