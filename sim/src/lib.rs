//! # Meridian Simulator
//!
//! Stand-ins for everything the engine talks to but does not own: yield
//! strategies and bridges. Both are in-memory and driven by the same
//! [`Clock`](meridian_engine::types::Clock) as the vaults, so a test can
//! step a year forward and watch fees and yield move together.
//!
//! - **strategy**: [`SimulatedStrategy`] with fault injection, and
//!   [`ReentrantStrategy`] for the reentrancy guard.
//! - **bridge**: [`LoopbackTransport`] and [`SimNetwork`], a set of vaults
//!   on several chains with a relayer between them.
//!
//! The integration suite under `tests/` runs the engine end to end on top
//! of these.

pub mod bridge;
pub mod strategy;

pub use bridge::{LoopbackTransport, RelayReport, SimNetwork};
pub use strategy::{Op, ReentrantStrategy, SimulatedStrategy, StrategyProfile};
