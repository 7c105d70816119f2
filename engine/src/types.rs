//! # Identity & Time Primitives
//!
//! Small newtypes shared by every module: holder addresses, chain and asset
//! identifiers, and the [`Clock`] abstraction the vault reads timestamps
//! from. Fee accrual and nonce derivation depend on time, so tests and the
//! simulator drive a [`ManualClock`] instead of the wall clock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted length of an address string.
pub const MAX_ADDRESS_LENGTH: usize = 128;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejected address input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("address exceeds {MAX_ADDRESS_LENGTH} characters ({0})")]
    TooLong(usize),

    #[error("address contains invalid character {0:?}")]
    InvalidCharacter(char),
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// An account identifier: a share holder, a role holder, or a remote vault.
///
/// The engine does not care about the address scheme of any particular
/// chain. It only requires a non-empty, bounded string drawn from
/// `[A-Za-z0-9:_.-]`, which covers hex, bech32 and `chain:account` forms.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parses and validates an address.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }
        if raw.len() > MAX_ADDRESS_LENGTH {
            return Err(AddressError::TooLong(raw.len()));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.' | '-')))
        {
            return Err(AddressError::InvalidCharacter(bad));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Chain & Asset
// ---------------------------------------------------------------------------

/// Numeric chain identifier (EVM chain id, Wormhole id, etc.).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(pub u32);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain-{}", self.0)
    }
}

/// Identifier of the underlying asset a vault accounts in (e.g. `"USDC"`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn new(symbol: &str) -> Self {
        Self(symbol.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a vault instance: exactly one vault exists per (asset, chain).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultKey {
    pub asset: AssetId,
    pub chain: ChainId,
}

impl VaultKey {
    pub fn new(asset: AssetId, chain: ChainId) -> Self {
        Self { asset, chain }
    }
}

impl fmt::Display for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.asset, self.chain.0)
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of unix timestamps (seconds) for the vault.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall clock backed by `chrono::Utc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// A clock that only moves when told to.
///
/// Used by tests and the simulator to step through fee periods and
/// rebalance cooldowns deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, timestamp: u64) {
        self.now.store(timestamp, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) -> u64 {
        self.now.fetch_add(secs, Ordering::SeqCst) + secs
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
