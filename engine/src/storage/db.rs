//! # VaultStore: Persistent Vault State
//!
//! The persistence layer for vault instances, built on sled's embedded
//! key-value store. Everything a vault needs to survive a restart flows
//! through this module.
//!
//! ## Tree Layout
//!
//! | Tree        | Key                         | Value                            |
//! |-------------|-----------------------------|----------------------------------|
//! | `snapshots` | `vault key` (UTF-8)         | `blake3(body) ‖ bincode(body)`   |
//! | `inbound`   | `vault key ‖ 0x00 ‖ nonce`  | `bincode(InboundRecord)`         |
//! | `outbound`  | `vault key ‖ 0x00 ‖ nonce`  | `bincode(OutboundRecord)`        |
//!
//! The vault key (`"USDC@8453"`) prefixes every message key, so one store
//! can host several vaults and a prefix scan returns one vault's ledger.
//!
//! ## Atomicity
//!
//! [`VaultStore::commit`] writes the snapshot and every touched message
//! record in a single sled transaction across the three trees. A crash
//! can never leave a processed nonce on disk without the share mint that
//! went with it, or the other way round.

use std::path::Path;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};

use crate::crosschain::{InboundRecord, Nonce, OutboundRecord};
use crate::types::VaultKey;
use crate::vault::VaultSnapshot;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

const CHECKSUM_LEN: usize = 32;

// ---------------------------------------------------------------------------
// VaultStore
// ---------------------------------------------------------------------------

/// Persistent storage for vault snapshots and message ledgers.
///
/// Cheap to clone; all clones share the same sled instance.
#[derive(Debug, Clone)]
pub struct VaultStore {
    db: Db,
    snapshots: Tree,
    inbound: Tree,
    outbound: Tree,
}

impl VaultStore {
    /// Opens or creates a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A store that lives in a temporary location and disappears on drop.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let snapshots = db.open_tree("snapshots")?;
        let inbound = db.open_tree("inbound")?;
        let outbound = db.open_tree("outbound")?;
        Ok(Self {
            db,
            snapshots,
            inbound,
            outbound,
        })
    }

    // -- Writes --------------------------------------------------------------

    /// Atomically persists a snapshot plus the given message records.
    pub fn commit(
        &self,
        key: &VaultKey,
        snapshot: &VaultSnapshot,
        inbound: &[&InboundRecord],
        outbound: &[&OutboundRecord],
    ) -> StoreResult<()> {
        let snapshot_key = key.to_string();
        let snapshot_value = seal(snapshot)?;

        let mut inbound_rows = Vec::with_capacity(inbound.len());
        for record in inbound {
            inbound_rows.push((message_key(key, &record.message.nonce), encode(record)?));
        }
        let mut outbound_rows = Vec::with_capacity(outbound.len());
        for record in outbound {
            outbound_rows.push((message_key(key, &record.message.nonce), encode(record)?));
        }

        let result: Result<(), TransactionError<()>> = (&self.snapshots, &self.inbound, &self.outbound)
            .transaction(|(snapshots, inbound, outbound)| {
                snapshots.insert(snapshot_key.as_bytes(), snapshot_value.as_slice())?;
                for (k, v) in &inbound_rows {
                    inbound.insert(k.as_slice(), v.as_slice())?;
                }
                for (k, v) in &outbound_rows {
                    outbound.insert(k.as_slice(), v.as_slice())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            });
        match result {
            Ok(()) => {}
            Err(TransactionError::Storage(e)) => return Err(StoreError::Sled(e)),
            Err(TransactionError::Abort(())) => {
                return Err(StoreError::Corrupt("commit transaction aborted".to_string()))
            }
        }
        self.db.flush()?;
        Ok(())
    }

    // -- Reads ---------------------------------------------------------------

    /// Latest snapshot of `key`, checksum-verified.
    pub fn load_snapshot(&self, key: &VaultKey) -> StoreResult<Option<VaultSnapshot>> {
        match self.snapshots.get(key.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(unseal(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_inbound(&self, key: &VaultKey, nonce: &Nonce) -> StoreResult<Option<InboundRecord>> {
        match self.inbound.get(message_key(key, nonce))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_outbound(&self, key: &VaultKey, nonce: &Nonce) -> StoreResult<Option<OutboundRecord>> {
        match self.outbound.get(message_key(key, nonce))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every inbound record of `key`.
    pub fn load_inbound(&self, key: &VaultKey) -> StoreResult<Vec<InboundRecord>> {
        let mut out = Vec::new();
        for row in self.inbound.scan_prefix(key_prefix(key)) {
            let (_, value) = row?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Every outbound record of `key`.
    pub fn load_outbound(&self, key: &VaultKey) -> StoreResult<Vec<OutboundRecord>> {
        let mut out = Vec::new();
        for row in self.outbound.scan_prefix(key_prefix(key)) {
            let (_, value) = row?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn inbound_count(&self, key: &VaultKey) -> usize {
        self.inbound.scan_prefix(key_prefix(key)).count()
    }

    pub fn outbound_count(&self, key: &VaultKey) -> usize {
        self.outbound.scan_prefix(key_prefix(key)).count()
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn key_prefix(key: &VaultKey) -> Vec<u8> {
    let mut prefix = key.to_string().into_bytes();
    prefix.push(0);
    prefix
}

fn message_key(key: &VaultKey, nonce: &Nonce) -> Vec<u8> {
    let mut k = key_prefix(key);
    k.extend_from_slice(&nonce.0);
    k
}

fn encode<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn seal<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    let body = encode(value)?;
    let mut out = Vec::with_capacity(CHECKSUM_LEN + body.len());
    out.extend_from_slice(blake3::hash(&body).as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn unseal<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    if bytes.len() < CHECKSUM_LEN {
        return Err(StoreError::Corrupt("snapshot shorter than checksum".to_string()));
    }
    let (checksum, body) = bytes.split_at(CHECKSUM_LEN);
    if blake3::hash(body).as_bytes() != checksum {
        return Err(StoreError::Corrupt("snapshot checksum mismatch".to_string()));
    }
    decode(body)
}
