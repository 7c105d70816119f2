// Copyright (c) 2026 Meridian Contributors. MIT License.
// See LICENSE for details.

//! # Meridian Engine
//!
//! Accounting core of a multi-strategy yield vault that also settles
//! deposits and withdrawals across chains. Holders put one asset in and get
//! shares back; the vault spreads the asset over external strategies,
//! charges fees by diluting supply, and keeps a per-vault nonce ledger so a
//! bridge that delivers twice never mints twice.
//!
//! ## Architecture
//!
//! - **ledger**: share table, allowances and the rounding-aware exchange rate.
//! - **strategy**: the `Strategy` trait, slots, and the allocator that
//!   enforces the allocation ceiling.
//! - **rebalance**: pure planners for target rebalancing, incremental
//!   deployment and liquidity pulls, plus the executor.
//! - **fees**: management (time-based) and performance (harvest-based)
//!   fees, both minted as shares.
//! - **crosschain**: envelopes, nonces, route scoring, inbox and outbox.
//! - **emergency**: the Normal / Paused / EmergencyShutdown state machine.
//! - **access**: roles and the capability table.
//! - **vault**: the `Vault` that ties everything together under one lock.
//! - **registry**: one vault per (asset, chain).
//! - **storage**: snapshots and message ledgers on sled.
//! - **config**: constants and `VaultConfig`.
//!
//! ## Ground rules
//!
//! 1. Amounts are `u64` in the asset's smallest unit. Products go through
//!    `u128`; overflow is an error, never a wrap.
//! 2. Conversions round in the vault's favour: down when handing out,
//!    up when taking in.
//! 3. Strategies are untrusted. A failing or panicking strategy is logged
//!    and skipped; it never takes the vault down with it.

pub mod access;
pub mod config;
pub mod crosschain;
pub mod emergency;
pub mod error;
pub mod events;
pub mod fees;
pub mod ledger;
pub mod rebalance;
pub mod registry;
pub mod storage;
pub mod strategy;
pub mod types;
pub mod vault;

pub use error::{ErrorKind, VaultError, VaultResult};
pub use registry::VaultRegistry;
pub use vault::{Vault, VaultBuilder};
