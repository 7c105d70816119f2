//! # Cross-Chain Settlement
//!
//! The one asynchronous boundary of the engine. Outbound requests are
//! written to the [`Outbox`] before they reach the bridge; inbound
//! envelopes are checked against the [`Inbox`] nonce ledger before any
//! side effect, which turns at-least-once delivery into exactly-once
//! application.
//!
//! ```text
//! outbound:  Dispatched ──send ok──> InFlight ──confirm──> Applied
//!                │
//!                └─send err─> Failed ──retry──> Retried ──confirm──> Applied
//!
//! inbound:   (absent) ──apply ok──> Applied          redelivery: no-op
//!                │
//!                └─core effect err─> Failed ──retry──> Retried ──> Applied
//! ```
//!
//! This module owns routing, trust and the two ledgers. The ledger effects
//! of an inbound message (mint, burn, payout) live in the vault, which
//! calls in here from inside its critical section.
//!
//! ```text
//! message.rs: CrossChainMessage, Nonce
//! outbox.rs:  outbound records and transitions
//! inbox.rs:   processed-nonce ledger
//! bridge.rs:  BridgeTransport, RouteScorer, ReputationScorer
//! ```

pub mod bridge;
pub mod inbox;
pub mod message;
pub mod outbox;

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Address, ChainId};

pub use bridge::{BridgeProvider, BridgeRoute, BridgeTransport, ReputationScorer, RouteScorer, TransportError};
pub use inbox::{InboundEffect, InboundRecord, Inbox};
pub use message::{CrossChainMessage, MessageKind, Nonce};
pub use outbox::{OutboundRecord, Outbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Dispatched,
    InFlight,
    Failed,
    Retried,
    Applied,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Dispatched => "dispatched",
            MessageStatus::InFlight => "in_flight",
            MessageStatus::Failed => "failed",
            MessageStatus::Retried => "retried",
            MessageStatus::Applied => "applied",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("chain {0} is not trusted")]
    UntrustedChain(ChainId),

    #[error("sender vault {sender} is not the trusted vault for {chain}")]
    UntrustedSender { chain: ChainId, sender: Address },

    #[error("message addressed to {actual}, this vault is on {expected}")]
    WrongDestination { expected: ChainId, actual: ChainId },

    #[error("message nonce {0} does not match its envelope")]
    NonceMismatch(Nonce),

    #[error("unknown message {0}")]
    UnknownMessage(Nonce),

    #[error("message {nonce} cannot go from {from} via `{via}`")]
    InvalidTransition {
        nonce: Nonce,
        from: MessageStatus,
        via: &'static str,
    },

    #[error("no bridge route to {0} within the risk limit")]
    NoRoute(ChainId),

    #[error("no bridge transport configured")]
    NoTransport,

    #[error("cannot dispatch to the local chain {0}")]
    LocalDestination(ChainId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Latest totals a remote vault reported through `Sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteView {
    pub total_assets: u64,
    pub total_supply: u64,
    pub reported_at: u64,
    pub received_at: u64,
}

/// Status of a message in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum MessageLookup {
    Outbound(OutboundRecord),
    Inbound(InboundRecord),
}

/// Routing, trust and the two message ledgers of one vault.
pub struct CrossChainSettlement {
    local_chain: ChainId,
    trusted: BTreeMap<ChainId, Address>,
    inbox: Inbox,
    outbox: Outbox,
    remote_views: BTreeMap<ChainId, RemoteView>,
    scorer: Arc<dyn RouteScorer>,
    transport: Option<Arc<dyn BridgeTransport>>,
}

impl fmt::Debug for CrossChainSettlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossChainSettlement")
            .field("local_chain", &self.local_chain)
            .field("trusted", &self.trusted)
            .field("inbound", &self.inbox.processed_count())
            .field("outbound", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

impl CrossChainSettlement {
    pub fn new(local_chain: ChainId) -> Self {
        Self {
            local_chain,
            trusted: BTreeMap::new(),
            inbox: Inbox::new(),
            outbox: Outbox::new(),
            remote_views: BTreeMap::new(),
            scorer: Arc::new(ReputationScorer),
            transport: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn BridgeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RouteScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Replaces the ledgers and trust table with persisted ones.
    pub fn restore(
        &mut self,
        trusted: BTreeMap<ChainId, Address>,
        inbox: Inbox,
        outbox: Outbox,
        remote_views: BTreeMap<ChainId, RemoteView>,
    ) {
        self.trusted = trusted;
        self.inbox = inbox;
        self.outbox = outbox;
        self.remote_views = remote_views;
    }

    pub fn local_chain(&self) -> ChainId {
        self.local_chain
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn inbox_mut(&mut self) -> &mut Inbox {
        &mut self.inbox
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    pub fn remote_views(&self) -> &BTreeMap<ChainId, RemoteView> {
        &self.remote_views
    }

    pub fn record_remote_view(&mut self, chain: ChainId, view: RemoteView) {
        self.remote_views.insert(chain, view);
    }

    // -- Trust ---------------------------------------------------------------

    pub fn trusted(&self) -> &BTreeMap<ChainId, Address> {
        &self.trusted
    }

    pub fn trust_chain(&mut self, chain: ChainId, remote_vault: Address) {
        tracing::info!(%chain, %remote_vault, "chain trusted");
        self.trusted.insert(chain, remote_vault);
    }

    pub fn untrust_chain(&mut self, chain: ChainId) -> bool {
        tracing::info!(%chain, "chain untrusted");
        self.trusted.remove(&chain).is_some()
    }

    /// Structural checks that run before the nonce ledger is consulted:
    /// destination, trusted source, trusted origin vault and nonce
    /// integrity. Failures leave no trace in the inbox.
    pub fn validate_inbound(&self, message: &CrossChainMessage) -> Result<(), SettlementError> {
        if message.destination_chain != self.local_chain {
            return Err(SettlementError::WrongDestination {
                expected: self.local_chain,
                actual: message.destination_chain,
            });
        }
        let remote = self
            .trusted
            .get(&message.source_chain)
            .ok_or(SettlementError::UntrustedChain(message.source_chain))?;
        if *remote != message.origin_vault {
            return Err(SettlementError::UntrustedSender {
                chain: message.source_chain,
                sender: message.origin_vault.clone(),
            });
        }
        if !message.verify_nonce() {
            return Err(SettlementError::NonceMismatch(message.nonce));
        }
        Ok(())
    }

    pub fn ensure_dispatchable(&self, destination: ChainId) -> Result<(), SettlementError> {
        if destination == self.local_chain {
            return Err(SettlementError::LocalDestination(destination));
        }
        if !self.trusted.contains_key(&destination) {
            return Err(SettlementError::UntrustedChain(destination));
        }
        if self.transport.is_none() {
            return Err(SettlementError::NoTransport);
        }
        Ok(())
    }

    // -- Routing & transport -------------------------------------------------

    pub fn select_route(&self, destination: ChainId, max_risk: u32) -> Result<BridgeRoute, SettlementError> {
        let transport = self.transport.as_ref().ok_or(SettlementError::NoTransport)?;
        let routes = transport.routes(destination);
        let route = self
            .scorer
            .select(&routes, max_risk)
            .ok_or(SettlementError::NoRoute(destination))?;
        tracing::debug!(
            %destination,
            provider = %route.provider,
            risk = self.scorer.risk(&route),
            "route selected"
        );
        Ok(route)
    }

    /// Hands an envelope to the transport. Panics inside the transport are
    /// reported as [`TransportError::Unavailable`].
    pub fn send(&self, route: &BridgeRoute, message: &CrossChainMessage) -> Result<(), SettlementError> {
        let transport = self.transport.as_ref().ok_or(SettlementError::NoTransport)?;
        match catch_unwind(AssertUnwindSafe(|| transport.send(route, message))) {
            Ok(result) => result.map_err(SettlementError::from),
            Err(_) => {
                tracing::error!(nonce = %message.nonce, "bridge transport panicked");
                Err(SettlementError::Transport(TransportError::Unavailable))
            }
        }
    }

    /// Looks a nonce up in both ledgers, outbound first.
    pub fn lookup(&self, nonce: &Nonce) -> Option<MessageLookup> {
        if let Some(record) = self.outbox.get(nonce) {
            return Some(MessageLookup::Outbound(record.clone()));
        }
        self.inbox
            .get(nonce)
            .map(|record| MessageLookup::Inbound(record.clone()))
    }
}
