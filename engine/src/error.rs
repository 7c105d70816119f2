//! Top-level error type of the vault and its coarse classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::AccessError;
use crate::config::ConfigError;
use crate::crosschain::SettlementError;
use crate::emergency::EmergencyError;
use crate::fees::FeeError;
use crate::ledger::LedgerError;
use crate::rebalance::RebalanceError;
use crate::storage::StoreError;
use crate::strategy::{AllocatorError, StrategyError};
use crate::types::{AddressError, VaultKey};

/// Failure classes callers can act on without inspecting variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input; nothing changed.
    Validation,
    /// A limit would be exceeded; nothing changed.
    Capacity,
    /// Not enough shares or allowance.
    InsufficientFunds,
    /// Recovered liquidity fell short of the tolerance.
    SlippageExceeded,
    /// An external strategy or bridge call failed.
    StrategyFailure,
    Unauthorized,
    /// The vault's current state forbids the operation.
    InvalidState,
    /// Re-entrant call into a vault with an operation in progress.
    Reentrancy,
    Storage,
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("amount {amount} is below the minimum of {minimum}")]
    BelowMinimum { amount: u64, minimum: u64 },

    #[error("operation would mint zero shares")]
    ZeroShares,

    #[error("operation would pay out zero assets")]
    ZeroAssets,

    #[error("deposit of {requested} exceeds remaining capacity {available}")]
    DepositLimit { requested: u64, available: u64 },

    #[error("recovered {recovered} of {requested}, shortfall above {max_slippage_bps} bps")]
    SlippageExceeded {
        requested: u64,
        recovered: u64,
        max_slippage_bps: u64,
    },

    #[error("re-entrant call to `{op}` rejected")]
    Reentrancy { op: &'static str },

    #[error("vault {0} already registered")]
    VaultExists(VaultKey),

    #[error("no vault registered for {0}")]
    UnknownVault(VaultKey),

    #[error("cannot restore vault: {0}")]
    Restore(String),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Rebalance(#[from] RebalanceError),

    #[error(transparent)]
    Fee(#[from] FeeError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Emergency(#[from] EmergencyError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        use ErrorKind::*;
        match self {
            VaultError::ZeroAmount
            | VaultError::BelowMinimum { .. }
            | VaultError::ZeroShares
            | VaultError::ZeroAssets
            | VaultError::UnknownVault(_)
            | VaultError::Address(_)
            | VaultError::Config(_) => Validation,
            VaultError::DepositLimit { .. } => Capacity,
            VaultError::SlippageExceeded { .. } => SlippageExceeded,
            VaultError::Reentrancy { .. } => Reentrancy,
            VaultError::VaultExists(_) => InvalidState,
            VaultError::Restore(_) | VaultError::Store(_) => Storage,
            VaultError::Ledger(e) => ledger_kind(e),
            VaultError::Allocator(e) => match e {
                AllocatorError::AllocationExceeded { .. } | AllocatorError::SlotLimit(_) => Capacity,
                AllocatorError::Strategy(_) => StrategyFailure,
                AllocatorError::AssetMismatch { .. }
                | AllocatorError::UnknownStrategy(_)
                | AllocatorError::InvalidAllocation(_)
                | AllocatorError::InvalidMaxLoss(_)
                | AllocatorError::NoBadDebt(_) => Validation,
            },
            VaultError::Strategy(_) => StrategyFailure,
            VaultError::Rebalance(_) => InvalidState,
            VaultError::Fee(e) => match e {
                FeeError::Ledger(inner) => ledger_kind(inner),
                _ => Validation,
            },
            VaultError::Settlement(e) => match e {
                SettlementError::InvalidTransition { .. } => InvalidState,
                SettlementError::NoRoute(_)
                | SettlementError::NoTransport
                | SettlementError::Transport(_) => StrategyFailure,
                _ => Validation,
            },
            VaultError::Emergency(_) => InvalidState,
            VaultError::Access(e) => match e {
                AccessError::Unauthorized { .. } | AccessError::NotOwner { .. } => Unauthorized,
                AccessError::LastAdmin => InvalidState,
            },
        }
    }
}

fn ledger_kind(e: &LedgerError) -> ErrorKind {
    match e {
        LedgerError::InsufficientShares { .. } | LedgerError::InsufficientAllowance { .. } => {
            ErrorKind::InsufficientFunds
        }
        LedgerError::ArithmeticOverflow => ErrorKind::Capacity,
        LedgerError::DivisionByZero => ErrorKind::InvalidState,
    }
}
