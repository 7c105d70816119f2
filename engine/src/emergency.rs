//! # Emergency Controller
//!
//! ```text
//!            pause                 activate_shutdown
//!   Normal ─────────> Paused ───────────────────────> EmergencyShutdown
//!     ^  <───────────   │                                  │
//!     │    unpause      └───────── activate_shutdown ──────┤
//!     │                                                    │
//!     └──── unpause ──── Paused <──── clear_shutdown ──────┘
//! ```
//!
//! Shutdown is terminal until an admin clears it, and clearing only goes
//! back to `Paused` so the operator has to resume explicitly. The gate
//! methods answer "may this operation run in the current state?".

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyState {
    #[default]
    Normal,
    Paused,
    EmergencyShutdown,
}

impl fmt::Display for EmergencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmergencyState::Normal => "normal",
            EmergencyState::Paused => "paused",
            EmergencyState::EmergencyShutdown => "emergency_shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmergencyError {
    #[error("operation `{op}` is not allowed while {state}")]
    NotAllowed { op: &'static str, state: EmergencyState },

    #[error("invalid transition from {from} via `{via}`")]
    InvalidTransition { from: EmergencyState, via: &'static str },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyController {
    state: EmergencyState,
    /// Timestamp of the latest shutdown activation.
    shutdown_at: Option<u64>,
}

impl EmergencyController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: EmergencyState, shutdown_at: Option<u64>) -> Self {
        Self { state, shutdown_at }
    }

    pub fn state(&self) -> EmergencyState {
        self.state
    }

    pub fn shutdown_at(&self) -> Option<u64> {
        self.shutdown_at
    }

    // -- Transitions ---------------------------------------------------------

    pub fn pause(&mut self) -> Result<(), EmergencyError> {
        self.transition(EmergencyState::Normal, EmergencyState::Paused, "pause")
    }

    pub fn unpause(&mut self) -> Result<(), EmergencyError> {
        self.transition(EmergencyState::Paused, EmergencyState::Normal, "unpause")
    }

    /// Enters shutdown from `Normal` or `Paused`. Returns the prior state.
    pub fn activate_shutdown(&mut self, now: u64) -> Result<EmergencyState, EmergencyError> {
        let previous = self.state;
        if previous == EmergencyState::EmergencyShutdown {
            return Err(EmergencyError::InvalidTransition {
                from: previous,
                via: "activate_shutdown",
            });
        }
        self.state = EmergencyState::EmergencyShutdown;
        self.shutdown_at = Some(now);
        tracing::warn!(%previous, "emergency shutdown activated");
        Ok(previous)
    }

    pub fn clear_shutdown(&mut self) -> Result<(), EmergencyError> {
        self.transition(
            EmergencyState::EmergencyShutdown,
            EmergencyState::Paused,
            "clear_shutdown",
        )
    }

    fn transition(
        &mut self,
        from: EmergencyState,
        to: EmergencyState,
        via: &'static str,
    ) -> Result<(), EmergencyError> {
        if self.state != from {
            return Err(EmergencyError::InvalidTransition {
                from: self.state,
                via,
            });
        }
        tracing::info!(%from, %to, "emergency state changed");
        self.state = to;
        Ok(())
    }

    // -- Gates ---------------------------------------------------------------

    /// Deposits, mints, rebalances, auto-invest and outbound dispatch.
    pub fn ensure_normal(&self, op: &'static str) -> Result<(), EmergencyError> {
        match self.state {
            EmergencyState::Normal => Ok(()),
            state => Err(EmergencyError::NotAllowed { op, state }),
        }
    }

    /// Withdraw and redeem stay open during shutdown so holders can exit.
    pub fn ensure_withdrawals_open(&self, op: &'static str) -> Result<(), EmergencyError> {
        match self.state {
            EmergencyState::Paused => Err(EmergencyError::NotAllowed {
                op,
                state: EmergencyState::Paused,
            }),
            _ => Ok(()),
        }
    }

    pub fn ensure_shutdown(&self, op: &'static str) -> Result<(), EmergencyError> {
        match self.state {
            EmergencyState::EmergencyShutdown => Ok(()),
            state => Err(EmergencyError::NotAllowed { op, state }),
        }
    }

    /// The admin-only strategy unwind path.
    pub fn ensure_halted(&self, op: &'static str) -> Result<(), EmergencyError> {
        match self.state {
            EmergencyState::Normal => Err(EmergencyError::NotAllowed {
                op,
                state: EmergencyState::Normal,
            }),
            _ => Ok(()),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.state == EmergencyState::EmergencyShutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_unpause_cycle() {
        let mut ec = EmergencyController::new();
        ec.pause().unwrap();
        assert_eq!(ec.state(), EmergencyState::Paused);
        assert!(ec.pause().is_err());
        ec.unpause().unwrap();
        assert_eq!(ec.state(), EmergencyState::Normal);
    }

    #[test]
    fn shutdown_is_one_way_until_cleared() {
        let mut ec = EmergencyController::new();
        ec.pause().unwrap();
        assert_eq!(ec.activate_shutdown(100).unwrap(), EmergencyState::Paused);
        assert_eq!(ec.shutdown_at(), Some(100));

        assert!(ec.activate_shutdown(101).is_err());
        assert!(ec.unpause().is_err());
        assert!(ec.pause().is_err());

        ec.clear_shutdown().unwrap();
        assert_eq!(ec.state(), EmergencyState::Paused);
    }

    #[test]
    fn gates_follow_state() {
        let mut ec = EmergencyController::new();
        assert!(ec.ensure_normal("deposit").is_ok());
        assert!(ec.ensure_withdrawals_open("withdraw").is_ok());
        assert!(ec.ensure_shutdown("emergency_withdraw").is_err());
        assert!(ec.ensure_halted("emergency_withdraw_strategy").is_err());

        ec.pause().unwrap();
        assert!(ec.ensure_normal("deposit").is_err());
        assert!(ec.ensure_withdrawals_open("withdraw").is_err());
        assert!(ec.ensure_halted("emergency_withdraw_strategy").is_ok());

        ec.activate_shutdown(1).unwrap();
        assert!(ec.ensure_normal("rebalance").is_err());
        assert!(ec.ensure_withdrawals_open("redeem").is_ok());
        assert!(ec.ensure_shutdown("emergency_withdraw").is_ok());
    }
}
