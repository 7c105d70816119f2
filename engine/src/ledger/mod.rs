//! # Ledger: Shares, Assets and the Exchange Rate
//!
//! The ledger answers one question: how many shares is an amount of assets
//! worth right now, and vice versa. It owns the share table
//! ([`ShareLedger`]) and the conversion math ([`ExchangeRate`]); the
//! vault aggregate supplies the totals.
//!
//! ```text
//! math.rs:    ExchangeRate, Rounding, mul_div
//! shares.rs:  ShareLedger: balances, supply, allowances
//! ```
//!
//! Rounding always favors the vault:
//!
//! | operation          | converts            | rounds |
//! |--------------------|---------------------|--------|
//! | `preview_deposit`  | assets -> shares    | down   |
//! | `preview_mint`     | shares -> assets    | up     |
//! | `preview_withdraw` | assets -> shares    | up     |
//! | `preview_redeem`   | shares -> assets    | down   |

pub mod math;
pub mod shares;

use thiserror::Error;

use crate::types::Address;

pub use math::{bps_of, mul_div, ExchangeRate, Rounding};
pub use shares::ShareLedger;

/// Errors raised by share accounting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient shares for {holder}: available {available}, requested {requested}")]
    InsufficientShares {
        holder: Address,
        available: u64,
        requested: u64,
    },

    #[error("insufficient allowance: {spender} may move {allowed} of {owner}'s shares, requested {requested}")]
    InsufficientAllowance {
        owner: Address,
        spender: Address,
        allowed: u64,
        requested: u64,
    },

    #[error("arithmetic overflow in share accounting")]
    ArithmeticOverflow,

    #[error("division by zero in share accounting")]
    DivisionByZero,
}
