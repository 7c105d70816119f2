//! Vault events for off-chain observability.
//!
//! Every state transition pushes a [`VaultEvent`] into the vault's
//! [`EventLog`]. The host drains the buffer after each call and fans the
//! events out (WebSocket, metrics, logs). Events carry the vault clock's
//! timestamp of the operation that produced them.

use serde::{Deserialize, Serialize};

use crate::access::Role;
use crate::crosschain::{MessageKind, Nonce};
use crate::emergency::EmergencyState;
use crate::strategy::StrategyId;
use crate::types::{Address, ChainId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultEvent {
    Deposit {
        caller: Address,
        receiver: Address,
        assets: u64,
        shares: u64,
    },
    Withdraw {
        caller: Address,
        receiver: Address,
        owner: Address,
        assets: u64,
        shares: u64,
    },
    EmergencyWithdraw {
        owner: Address,
        shares: u64,
        assets: u64,
    },
    StrategyAdded {
        strategy: StrategyId,
        name: String,
        allocation_bps: u64,
    },
    StrategyRemoved {
        strategy: StrategyId,
        recovered: u64,
    },
    AllocationUpdated {
        strategy: StrategyId,
        from_bps: u64,
        to_bps: u64,
    },
    StrategyUnwound {
        strategy: StrategyId,
        recovered: u64,
    },
    StrategyHarvested {
        strategy: StrategyId,
        amount: u64,
    },
    StrategyLossExceeded {
        strategy: StrategyId,
        requested: u64,
        received: u64,
    },
    BadDebtRecorded {
        strategy: StrategyId,
        amount: u64,
    },
    BadDebtRecovered {
        strategy: StrategyId,
        amount: u64,
    },
    FeeCollected {
        recipient: Address,
        management_shares: u64,
        performance_shares: u64,
    },
    Rebalanced {
        withdrawn: u64,
        deposited: u64,
        failures: usize,
    },
    SlippageProtectionTriggered {
        requested: u64,
        recovered: u64,
        max_slippage_bps: u64,
    },
    Paused,
    Unpaused,
    EmergencyShutdownActivated {
        previous: EmergencyState,
    },
    EmergencyShutdownCleared,
    CrossChainDepositInitiated {
        nonce: Nonce,
        destination: ChainId,
        amount: u64,
    },
    CrossChainWithdrawInitiated {
        nonce: Nonce,
        destination: ChainId,
        shares: u64,
    },
    CrossChainDepositCompleted {
        nonce: Nonce,
        receiver: Address,
        shares: u64,
    },
    CrossChainWithdrawCompleted {
        nonce: Nonce,
        assets: u64,
    },
    CrossChainMessageConfirmed {
        nonce: Nonce,
        kind: MessageKind,
    },
    CrossChainMessageFailed {
        nonce: Nonce,
        kind: MessageKind,
        reason: String,
    },
    CrossChainSyncReceived {
        source: ChainId,
        total_assets: u64,
        total_supply: u64,
    },
    RoleGranted {
        account: Address,
        role: Role,
    },
    RoleRevoked {
        account: Address,
        role: Role,
    },
}

/// A timestamped event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub at: u64,
    #[serde(flatten)]
    pub event: VaultEvent,
}

/// Bounded buffer of undelivered events.
#[derive(Debug, Default)]
pub struct EventLog {
    pending: Vec<EventRecord>,
    dropped: u64,
}

/// Events kept when nobody drains the log.
pub const EVENT_BUFFER_CAPACITY: usize = 4_096;

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, at: u64, event: VaultEvent) {
        tracing::debug!(?event, "vault event");
        if self.pending.len() >= EVENT_BUFFER_CAPACITY {
            self.pending.remove(0);
            self.dropped += 1;
        }
        self.pending.push(EventRecord { at, event });
    }

    pub fn drain(&mut self) -> Vec<EventRecord> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Events discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
