//! Cross-chain entry points of the vault.
//!
//! Outbound: the message is reserved in the outbox and committed to the
//! store before the transport sees it, so a crash after `send` can never
//! produce a second dispatch of the same request. Inbound: the nonce
//! ledger is consulted first and a processed nonce is a no-op.

use serde::{Deserialize, Serialize};

use crate::access::{AccessError, Capability};
use crate::crosschain::{
    BridgeRoute, CrossChainMessage, InboundEffect, MessageKind, MessageLookup, MessageStatus, Nonce, RemoteView,
    SettlementError,
};
use crate::error::{VaultError, VaultResult};
use crate::events::VaultEvent;
use crate::ledger::{LedgerError, Rounding};
use crate::types::{Address, ChainId};

use super::state::VaultState;
use super::Vault;

/// Handle returned by every dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub nonce: Nonce,
    pub status: MessageStatus,
    /// `false` when the same logical request had already been dispatched.
    pub created: bool,
}

/// Result of handing an inbound envelope to the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied { effect: InboundEffect },
    /// Already processed; nothing happened.
    Duplicate,
    /// The core effect failed; the nonce stays open for `retry`.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum RetryOutcome {
    Outbound { status: MessageStatus },
    Inbound { outcome: ApplyOutcome },
}

impl VaultState {
    // -- Outbound ------------------------------------------------------------

    /// Reserves, persists, then sends. A known nonce returns its receipt.
    fn dispatch(&mut self, now: u64, message: CrossChainMessage, escrow: u64) -> VaultResult<DispatchReceipt> {
        let nonce = message.nonce;
        if let Some(existing) = self.settlement.outbox().get(&nonce) {
            tracing::debug!(%nonce, status = %existing.status, "dispatch already known");
            return Ok(DispatchReceipt {
                nonce,
                status: existing.status,
                created: false,
            });
        }
        let route = self
            .settlement
            .select_route(message.destination_chain, self.config.max_route_risk)?;

        self.settlement.outbox_mut().reserve(message.clone(), escrow, now);
        self.touch_outbound(nonce);
        self.commit(now)?;
        match message.kind {
            MessageKind::Deposit => self.emit(
                now,
                VaultEvent::CrossChainDepositInitiated {
                    nonce,
                    destination: message.destination_chain,
                    amount: message.amount,
                },
            ),
            MessageKind::Withdraw => self.emit(
                now,
                VaultEvent::CrossChainWithdrawInitiated {
                    nonce,
                    destination: message.destination_chain,
                    shares: message.amount,
                },
            ),
            MessageKind::Sync => {}
        }

        let status = self.send_outbound(now, &message, route)?;
        Ok(DispatchReceipt {
            nonce,
            status,
            created: true,
        })
    }

    fn send_outbound(&mut self, now: u64, message: &CrossChainMessage, route: BridgeRoute) -> VaultResult<MessageStatus> {
        let nonce = message.nonce;
        self.touch_outbound(nonce);
        match self.settlement.send(&route, message) {
            Ok(()) => {
                tracing::info!(%nonce, provider = %route.provider, kind = ?message.kind, "message sent");
                let released = self.settlement.outbox_mut().mark_sent(&nonce, route, now)?;
                self.flows.bridged_out = self.flows.bridged_out.saturating_add(released);
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(%nonce, error = %reason, "message send failed");
                self.settlement
                    .outbox_mut()
                    .mark_failed(&nonce, reason.clone(), now)?;
                self.emit(
                    now,
                    VaultEvent::CrossChainMessageFailed {
                        nonce,
                        kind: message.kind,
                        reason,
                    },
                );
            }
        }
        self.settlement
            .outbox()
            .get(&nonce)
            .map(|r| r.status)
            .ok_or_else(|| SettlementError::UnknownMessage(nonce).into())
    }

    fn retry_outbound(&mut self, now: u64, nonce: Nonce) -> VaultResult<MessageStatus> {
        let message = self.settlement.outbox_mut().begin_retry(&nonce, now)?;
        self.touch_outbound(nonce);
        let route = match self
            .settlement
            .select_route(message.destination_chain, self.config.max_route_risk)
        {
            Ok(route) => route,
            Err(e) => {
                self.settlement
                    .outbox_mut()
                    .mark_failed(&nonce, e.to_string(), now)?;
                return Err(e.into());
            }
        };
        self.send_outbound(now, &message, route)
    }

    // -- Inbound -------------------------------------------------------------

    /// Runs the core effect of `message` and records the outcome in the
    /// nonce ledger. Only a successful core effect marks the nonce
    /// processed; follow-up failures are noted on the record.
    fn apply_inbound(&mut self, now: u64, message: CrossChainMessage) -> ApplyOutcome {
        let nonce = message.nonce;
        self.touch_inbound(nonce);
        let result = match message.kind {
            MessageKind::Deposit => self.apply_deposit(now, &message),
            MessageKind::Withdraw => self.apply_withdraw(now, &message),
            MessageKind::Sync => self.apply_sync(now, &message),
        };
        match result {
            Ok((effect, follow_up_error)) => {
                tracing::info!(%nonce, kind = ?message.kind, source = %message.source_chain, "inbound message applied");
                self.settlement
                    .inbox_mut()
                    .record_applied(message, effect, follow_up_error, now);
                ApplyOutcome::Applied { effect }
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(%nonce, kind = ?message.kind, error = %reason, "inbound message failed");
                let kind = message.kind;
                self.settlement
                    .inbox_mut()
                    .record_failed(message, reason.clone(), now);
                self.emit(
                    now,
                    VaultEvent::CrossChainMessageFailed {
                        nonce,
                        kind,
                        reason: reason.clone(),
                    },
                );
                ApplyOutcome::Failed { reason }
            }
        }
    }

    fn apply_deposit(&mut self, now: u64, message: &CrossChainMessage) -> VaultResult<(InboundEffect, Option<String>)> {
        self.emergency.ensure_normal("inbound_deposit")?;
        if message.amount == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let assets = message.amount;
        let rate = self.settle_fees(now)?;
        self.check_capacity(assets, rate.total_assets)?;
        let shares = rate.to_shares(assets, Rounding::Down)?;
        if shares == 0 {
            return Err(VaultError::ZeroShares);
        }
        self.credit(&message.receiver, assets, shares)?;
        self.flows.bridged_in = self.flows.bridged_in.saturating_add(assets);
        self.emit(
            now,
            VaultEvent::CrossChainDepositCompleted {
                nonce: message.nonce,
                receiver: message.receiver.clone(),
                shares,
            },
        );

        // auto-invest is best effort; the mint above stands regardless
        let mut follow_up_error = None;
        if Self::is_large_inflow(assets, rate.total_assets) {
            let report = self.deploy_idle(now);
            if !report.failures.is_empty() {
                let reasons: Vec<String> = report
                    .failures
                    .iter()
                    .map(|(id, reason)| format!("{id}: {reason}"))
                    .collect();
                follow_up_error = Some(reasons.join("; "));
            }
        }
        Ok((
            InboundEffect {
                shares_minted: shares,
                ..Default::default()
            },
            follow_up_error,
        ))
    }

    fn apply_withdraw(&mut self, now: u64, message: &CrossChainMessage) -> VaultResult<(InboundEffect, Option<String>)> {
        self.emergency.ensure_withdrawals_open("inbound_withdraw")?;
        let owner = &message.sender;
        let shares = message.amount;
        if shares == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let available = self.ledger.balance_of(owner);
        if available < shares {
            return Err(LedgerError::InsufficientShares {
                holder: owner.clone(),
                available,
                requested: shares,
            }
            .into());
        }
        let rate = self.settle_fees(now)?;
        let assets = rate.to_assets(shares, Rounding::Down)?;
        if assets == 0 {
            return Err(VaultError::ZeroAssets);
        }
        self.pull_liquidity(assets, now);
        self.check_slippage(assets, now)?;
        self.ledger.burn(owner, shares)?;
        let paid = self.pay_out(assets);
        self.flows.bridged_out = self.flows.bridged_out.saturating_add(paid);
        self.emit(
            now,
            VaultEvent::CrossChainWithdrawCompleted {
                nonce: message.nonce,
                assets: paid,
            },
        );
        Ok((
            InboundEffect {
                shares_burned: shares,
                assets_released: paid,
                ..Default::default()
            },
            None,
        ))
    }

    fn apply_sync(&mut self, now: u64, message: &CrossChainMessage) -> VaultResult<(InboundEffect, Option<String>)> {
        let view = RemoteView {
            total_assets: message.amount,
            total_supply: message.reported_supply,
            reported_at: message.timestamp,
            received_at: now,
        };
        if let Some(known) = self.settlement.remote_views().get(&message.source_chain) {
            if known.reported_at > view.reported_at {
                tracing::debug!(source = %message.source_chain, "stale sync ignored");
                return Ok((InboundEffect::default(), None));
            }
        }
        self.settlement.record_remote_view(message.source_chain, view);
        self.emit(
            now,
            VaultEvent::CrossChainSyncReceived {
                source: message.source_chain,
                total_assets: view.total_assets,
                total_supply: view.total_supply,
            },
        );
        Ok((InboundEffect::default(), None))
    }
}

impl Vault {
    /// Sends `assets` of `sender` to this vault's counterpart on
    /// `destination`, to be deposited for `receiver` there. The assets
    /// sit in escrow until the transport accepts the message.
    pub fn dispatch_deposit(
        &self,
        sender: &Address,
        assets: u64,
        destination: ChainId,
        receiver: &Address,
    ) -> VaultResult<DispatchReceipt> {
        self.mutate("dispatch_deposit", |s, now| {
            s.emergency.ensure_normal("dispatch_deposit")?;
            s.check_inflow_amount(assets)?;
            s.settlement.ensure_dispatchable(destination)?;
            let message = CrossChainMessage::new(
                MessageKind::Deposit,
                sender.clone(),
                receiver.clone(),
                assets,
                s.settlement.local_chain(),
                destination,
                s.address.clone(),
                now,
            );
            s.dispatch(now, message, assets)
        })
    }

    /// Asks the vault on `destination`, where `owner` holds shares, to
    /// redeem `shares` and release the assets to `receiver` here. Only the
    /// owner may ask: the destination burns the sender's shares without a
    /// further check.
    pub fn dispatch_withdraw(
        &self,
        caller: &Address,
        owner: &Address,
        shares: u64,
        destination: ChainId,
        receiver: &Address,
    ) -> VaultResult<DispatchReceipt> {
        self.mutate("dispatch_withdraw", |s, now| {
            if caller != owner {
                return Err(AccessError::NotOwner {
                    caller: caller.clone(),
                    owner: owner.clone(),
                }
                .into());
            }
            if shares == 0 {
                return Err(VaultError::ZeroAmount);
            }
            s.settlement.ensure_dispatchable(destination)?;
            let message = CrossChainMessage::new(
                MessageKind::Withdraw,
                owner.clone(),
                receiver.clone(),
                shares,
                s.settlement.local_chain(),
                destination,
                s.address.clone(),
                now,
            );
            s.dispatch(now, message, 0)
        })
    }

    /// Announces this vault's totals to `destination`.
    pub fn dispatch_sync(&self, caller: &Address, destination: ChainId) -> VaultResult<DispatchReceipt> {
        self.mutate("dispatch_sync", |s, now| {
            s.authorize(caller, Capability::RelayMessages)?;
            s.settlement.ensure_dispatchable(destination)?;
            let total_assets = s.total_assets();
            let message = CrossChainMessage::sync(
                s.address.clone(),
                total_assets,
                s.ledger.total_supply(),
                s.settlement.local_chain(),
                destination,
                now,
            );
            s.dispatch(now, message, 0)
        })
    }

    /// Delivers an inbound envelope. Envelopes that fail validation are
    /// rejected without leaving a record; redelivery of a processed nonce
    /// returns [`ApplyOutcome::Duplicate`].
    pub fn receive(&self, caller: &Address, message: CrossChainMessage) -> VaultResult<ApplyOutcome> {
        self.mutate("receive", |s, now| {
            s.authorize(caller, Capability::RelayMessages)?;
            s.settlement.validate_inbound(&message)?;
            if s.settlement.inbox().is_processed(&message.nonce) {
                s.settlement.inbox_mut().note_duplicate(&message.nonce);
                return Ok(ApplyOutcome::Duplicate);
            }
            Ok(s.apply_inbound(now, message))
        })
    }

    /// Re-runs a failed message in either direction.
    pub fn retry(&self, caller: &Address, nonce: Nonce) -> VaultResult<RetryOutcome> {
        self.mutate("retry", |s, now| {
            s.authorize(caller, Capability::RelayMessages)?;
            if s.settlement.outbox().get(&nonce).is_some() {
                let status = s.retry_outbound(now, nonce)?;
                return Ok(RetryOutcome::Outbound { status });
            }
            let message = s.settlement.inbox_mut().begin_retry(&nonce, now)?;
            s.touch_inbound(nonce);
            let outcome = match s.settlement.validate_inbound(&message) {
                Ok(()) => s.apply_inbound(now, message),
                Err(e) => {
                    let reason = e.to_string();
                    s.settlement
                        .inbox_mut()
                        .record_failed(message, reason.clone(), now);
                    ApplyOutcome::Failed { reason }
                }
            };
            Ok(RetryOutcome::Inbound { outcome })
        })
    }

    /// The destination applied an outbound message.
    pub fn confirm_delivery(&self, caller: &Address, nonce: Nonce) -> VaultResult<()> {
        self.mutate("confirm_delivery", |s, now| {
            s.authorize(caller, Capability::RelayMessages)?;
            let kind = s.settlement.outbox_mut().confirm(&nonce, now)?.message.kind;
            s.touch_outbound(nonce);
            tracing::info!(%nonce, ?kind, "delivery confirmed");
            s.emit(now, VaultEvent::CrossChainMessageConfirmed { nonce, kind });
            Ok(())
        })
    }

    pub fn message_status(&self, nonce: &Nonce) -> VaultResult<Option<MessageLookup>> {
        self.read("message_status", |s, _| Ok(s.settlement.lookup(nonce)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::config::VaultConfig;
    use crate::crosschain::{BridgeProvider, BridgeTransport, TransportError};
    use crate::error::ErrorKind;
    use crate::types::{AssetId, ManualClock};
    use crate::vault::VaultBuilder;

    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<CrossChainMessage>>,
        failing: Mutex<bool>,
    }

    impl BridgeTransport for RecordingTransport {
        fn routes(&self, destination: ChainId) -> Vec<BridgeRoute> {
            vec![BridgeRoute {
                provider: BridgeProvider::LayerZero,
                source: ChainId(1),
                destination,
                fee: 3,
                estimated_secs: 60,
                tvl_usd: 5_000_000_000,
                previously_exploited: false,
            }]
        }

        fn send(&self, _route: &BridgeRoute, message: &CrossChainMessage) -> Result<(), TransportError> {
            if *self.failing.lock() {
                return Err(TransportError::Unavailable);
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    fn vault(transport: Arc<RecordingTransport>) -> (Vault, Arc<ManualClock>) {
        let mut cfg = VaultConfig::new(AssetId::new("USDC"), ChainId(1));
        cfg.management_fee_bps = 0;
        let clock = Arc::new(ManualClock::new(500));
        let vault = VaultBuilder::new(cfg, addr("admin"))
            .address(addr("vault-1"))
            .clock(clock.clone())
            .transport(transport)
            .build()
            .unwrap();
        vault
            .trust_chain(&addr("admin"), ChainId(10), addr("vault-10"))
            .unwrap();
        (vault, clock)
    }

    fn inbound_deposit(amount: u64) -> CrossChainMessage {
        CrossChainMessage::new(
            MessageKind::Deposit,
            addr("bob"),
            addr("bob"),
            amount,
            ChainId(10),
            ChainId(1),
            addr("vault-10"),
            42,
        )
    }

    #[test]
    fn inbound_deposit_applies_once() {
        let (vault, _) = vault(Arc::new(RecordingTransport::default()));
        let admin = addr("admin");
        let msg = inbound_deposit(1_000);

        let first = vault.receive(&admin, msg.clone()).unwrap();
        assert!(matches!(first, ApplyOutcome::Applied { effect } if effect.shares_minted == 1_000));
        assert_eq!(vault.receive(&admin, msg).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(vault.balance_of(&addr("bob")).unwrap(), 1_000);
        assert_eq!(vault.total_assets().unwrap(), 1_000);
    }

    #[test]
    fn untrusted_envelope_leaves_no_record() {
        let (vault, _) = vault(Arc::new(RecordingTransport::default()));
        let mut msg = inbound_deposit(1_000);
        msg.origin_vault = addr("impostor");
        let err = vault.receive(&addr("admin"), msg.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(vault.message_status(&msg.nonce).unwrap().is_none());
    }

    #[test]
    fn failed_inbound_can_be_retried() {
        let (vault, _) = vault(Arc::new(RecordingTransport::default()));
        let admin = addr("admin");
        vault.pause(&admin).unwrap();
        let msg = inbound_deposit(700);

        let outcome = vault.receive(&admin, msg.clone()).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Failed { .. }));
        assert_eq!(vault.total_supply().unwrap(), 0);

        vault.unpause(&admin).unwrap();
        let retried = vault.retry(&admin, msg.nonce).unwrap();
        assert!(matches!(
            retried,
            RetryOutcome::Inbound {
                outcome: ApplyOutcome::Applied { .. }
            }
        ));
        assert_eq!(vault.balance_of(&addr("bob")).unwrap(), 700);
        assert_eq!(vault.receive(&admin, msg).unwrap(), ApplyOutcome::Duplicate);
    }

    #[test]
    fn dispatch_is_idempotent_per_request() {
        let transport = Arc::new(RecordingTransport::default());
        let (vault, _) = vault(transport.clone());
        let alice = addr("alice");

        let first = vault.dispatch_deposit(&alice, 300, ChainId(10), &alice).unwrap();
        assert!(first.created);
        assert_eq!(first.status, MessageStatus::InFlight);
        let again = vault.dispatch_deposit(&alice, 300, ChainId(10), &alice).unwrap();
        assert!(!again.created);
        assert_eq!(again.nonce, first.nonce);
        assert_eq!(transport.sent.lock().len(), 1);

        vault.confirm_delivery(&addr("admin"), first.nonce).unwrap();
        assert!(matches!(
            vault.message_status(&first.nonce).unwrap(),
            Some(MessageLookup::Outbound(r)) if r.status == MessageStatus::Applied
        ));
    }

    #[test]
    fn failed_send_keeps_escrow_until_retry() {
        let transport = Arc::new(RecordingTransport::default());
        *transport.failing.lock() = true;
        let (vault, _) = vault(transport.clone());
        let alice = addr("alice");

        let receipt = vault.dispatch_deposit(&alice, 300, ChainId(10), &alice).unwrap();
        assert_eq!(receipt.status, MessageStatus::Failed);
        assert_eq!(vault.summary().unwrap().escrowed, 300);

        *transport.failing.lock() = false;
        let retried = vault.retry(&addr("admin"), receipt.nonce).unwrap();
        assert_eq!(
            retried,
            RetryOutcome::Outbound {
                status: MessageStatus::Retried
            }
        );
        assert_eq!(vault.summary().unwrap().escrowed, 0);
        vault.confirm_delivery(&addr("admin"), receipt.nonce).unwrap();
    }

    #[test]
    fn inbound_withdraw_burns_and_releases() {
        let (vault, _) = vault(Arc::new(RecordingTransport::default()));
        let admin = addr("admin");
        vault.receive(&admin, inbound_deposit(1_000)).unwrap();

        let msg = CrossChainMessage::new(
            MessageKind::Withdraw,
            addr("bob"),
            addr("bob"),
            400,
            ChainId(10),
            ChainId(1),
            addr("vault-10"),
            43,
        );
        let outcome = vault.receive(&admin, msg).unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Applied { effect } if effect.shares_burned == 400 && effect.assets_released == 400
        ));
        assert_eq!(vault.balance_of(&addr("bob")).unwrap(), 600);
    }

    #[test]
    fn sync_records_remote_totals() {
        let (vault, _) = vault(Arc::new(RecordingTransport::default()));
        let msg = CrossChainMessage::sync(addr("vault-10"), 9_000, 8_000, ChainId(10), ChainId(1), 77);
        vault.receive(&addr("admin"), msg).unwrap();
        let views = vault.remote_views().unwrap();
        assert_eq!(views[0].0, ChainId(10));
        assert_eq!(views[0].1.total_assets, 9_000);
        assert_eq!(views[0].1.total_supply, 8_000);
    }
}
