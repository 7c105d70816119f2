//! # Storage Module
//!
//! Durable state for vault instances: the latest [`VaultSnapshot`]
//! (share table, fees, slots, emergency state) and the inbound/outbound
//! message ledgers that make cross-chain replay protection survive a
//! restart.
//!
//! Bincode on disk, JSON at the API. Snapshots carry a BLAKE3 checksum so
//! a torn or tampered record is refused instead of restored.
//!
//! [`VaultSnapshot`]: crate::vault::VaultSnapshot

pub mod db;

pub use db::{StoreError, StoreResult, VaultStore};
