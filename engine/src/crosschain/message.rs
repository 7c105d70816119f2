//! Cross-chain envelope and nonce derivation.
//!
//! A nonce is the SHA-256 digest of the message's identifying fields,
//! prefixed with a domain tag:
//!
//! ```text
//! sha256( "meridian/xchain-nonce/v1"
//!       || kind (1B)
//!       || len(sender) (2B BE) || sender
//!       || timestamp (8B BE) || amount (8B BE)
//!       || source_chain (4B BE) || destination_chain (4B BE) )
//! ```
//!
//! Relayers and remote vaults re-derive it, so it is plain SHA-256. Any
//! receiver can recompute the nonce from the envelope alone, so a
//! tampered envelope is detected without external state.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::config::NONCE_DOMAIN_TAG;
use crate::types::{Address, ChainId};

// ---------------------------------------------------------------------------
// Nonce
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nonce(pub [u8; 32]);

impl Nonce {
    pub fn derive(
        kind: MessageKind,
        sender: &Address,
        timestamp: u64,
        amount: u64,
        source_chain: ChainId,
        destination_chain: ChainId,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(NONCE_DOMAIN_TAG);
        hasher.update([kind.tag()]);
        let sender = sender.as_bytes();
        hasher.update((sender.len() as u16).to_be_bytes());
        hasher.update(sender);
        hasher.update(timestamp.to_be_bytes());
        hasher.update(amount.to_be_bytes());
        hasher.update(source_chain.0.to_be_bytes());
        hasher.update(destination_chain.0.to_be_bytes());
        Nonce(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)?;
        Ok(Nonce(out))
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({}..)", &self.to_hex()[..12])
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Nonce::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// `amount` is assets to deposit for `receiver`.
    Deposit,
    /// `amount` is shares of `sender` to redeem; assets go back to
    /// `receiver` on the source chain.
    Withdraw,
    /// `amount` is the remote vault's total assets, `reported_supply` its
    /// total shares.
    Sync,
}

impl MessageKind {
    fn tag(self) -> u8 {
        match self {
            MessageKind::Deposit => 1,
            MessageKind::Withdraw => 2,
            MessageKind::Sync => 3,
        }
    }
}

/// The cross-chain envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossChainMessage {
    pub kind: MessageKind,
    pub sender: Address,
    pub receiver: Address,
    pub amount: u64,
    #[serde(default)]
    pub reported_supply: u64,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    /// Vault that emitted the message on the source chain.
    pub origin_vault: Address,
    pub timestamp: u64,
    pub nonce: Nonce,
}

impl CrossChainMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: MessageKind,
        sender: Address,
        receiver: Address,
        amount: u64,
        source_chain: ChainId,
        destination_chain: ChainId,
        origin_vault: Address,
        timestamp: u64,
    ) -> Self {
        let nonce = Nonce::derive(kind, &sender, timestamp, amount, source_chain, destination_chain);
        Self {
            kind,
            sender,
            receiver,
            amount,
            reported_supply: 0,
            source_chain,
            destination_chain,
            origin_vault,
            timestamp,
            nonce,
        }
    }

    /// A `Sync` message announcing the sender vault's totals.
    pub fn sync(
        origin_vault: Address,
        total_assets: u64,
        total_supply: u64,
        source_chain: ChainId,
        destination_chain: ChainId,
        timestamp: u64,
    ) -> Self {
        let mut msg = Self::new(
            MessageKind::Sync,
            origin_vault.clone(),
            origin_vault.clone(),
            total_assets,
            source_chain,
            destination_chain,
            origin_vault,
            timestamp,
        );
        msg.reported_supply = total_supply;
        msg
    }

    pub fn expected_nonce(&self) -> Nonce {
        Nonce::derive(
            self.kind,
            &self.sender,
            self.timestamp,
            self.amount,
            self.source_chain,
            self.destination_chain,
        )
    }

    pub fn verify_nonce(&self) -> bool {
        self.expected_nonce() == self.nonce
    }
}
