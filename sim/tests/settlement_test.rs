//! Cross-chain settlement over the loopback bridge: at-least-once delivery
//! turned into exactly-once effects, send failures and retries, forged
//! envelopes, and inbound failures that leave the nonce open.

use std::sync::Arc;

use meridian_engine::crosschain::{MessageLookup, MessageStatus, Nonce};
use meridian_engine::error::ErrorKind;
use meridian_engine::types::{Address, AssetId, ChainId, ManualClock};
use meridian_engine::vault::{ApplyOutcome, RetryOutcome};
use meridian_sim::{Op, RelayReport, SimNetwork, SimulatedStrategy, StrategyProfile};

const HOME: ChainId = ChainId(1);
const REMOTE: ChainId = ChainId(10);

fn addr(s: &str) -> Address {
    Address::parse(s).unwrap()
}

fn network() -> (SimNetwork, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let mut net = SimNetwork::new(AssetId::new("USDC"), clock.clone()).unwrap();
    for chain in [HOME, REMOTE] {
        net.add_chain(chain, |c| c.management_fee_bps = 0).unwrap();
    }
    (net, clock)
}

fn outbound_status(net: &SimNetwork, chain: ChainId, nonce: &Nonce) -> MessageStatus {
    match net.vault(chain).unwrap().message_status(nonce).unwrap() {
        Some(MessageLookup::Outbound(record)) => record.status,
        other => panic!("expected an outbound record, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[test]
fn redelivered_deposit_mints_once() {
    let (net, _) = network();
    net.set_redeliver(true);
    let alice = addr("alice");
    let home = net.vault(HOME).unwrap();
    let remote = net.vault(REMOTE).unwrap();

    let receipt = home.dispatch_deposit(&alice, 5_000, REMOTE, &alice).unwrap();
    assert!(receipt.created);
    assert_eq!(receipt.status, MessageStatus::InFlight);

    let report = net.relay().unwrap();
    assert_eq!(
        report,
        RelayReport {
            delivered: 2,
            applied: 1,
            duplicates: 1,
            failed: 0,
            confirmed: 1,
        }
    );
    assert_eq!(remote.balance_of(&alice).unwrap(), 5_000);
    assert_eq!(remote.total_assets().unwrap(), 5_000);
    assert_eq!(remote.flows().unwrap().bridged_in, 5_000);
    assert_eq!(home.total_assets().unwrap(), 0);
    assert_eq!(home.flows().unwrap().bridged_out, 5_000);
    assert_eq!(outbound_status(&net, HOME, &receipt.nonce), MessageStatus::Applied);
    assert_eq!(remote.summary().unwrap().inbound_duplicates, 1);

    // Same request through a bridge that delivers once: same end state.
    let (single, _) = network();
    single
        .vault(HOME)
        .unwrap()
        .dispatch_deposit(&alice, 5_000, REMOTE, &alice)
        .unwrap();
    single.relay().unwrap();
    let other = single.vault(REMOTE).unwrap();
    assert_eq!(other.balance_of(&alice).unwrap(), remote.balance_of(&alice).unwrap());
    assert_eq!(other.total_supply().unwrap(), remote.total_supply().unwrap());
    assert_eq!(other.total_assets().unwrap(), remote.total_assets().unwrap());

    assert_eq!(net.relay().unwrap(), RelayReport::default());
}

#[test]
fn repeated_dispatch_reuses_the_nonce() {
    let (net, clock) = network();
    let alice = addr("alice");
    let home = net.vault(HOME).unwrap();

    let first = home.dispatch_deposit(&alice, 800, REMOTE, &alice).unwrap();
    let again = home.dispatch_deposit(&alice, 800, REMOTE, &alice).unwrap();
    assert_eq!(first.nonce, again.nonce);
    assert!(!again.created);
    assert_eq!(net.transport(HOME).unwrap().accepted(), 1);

    // A second of difference is a different request.
    clock.advance(1);
    let later = home.dispatch_deposit(&alice, 800, REMOTE, &alice).unwrap();
    assert!(later.created);
    assert_ne!(later.nonce, first.nonce);

    net.relay().unwrap();
    assert_eq!(net.vault(REMOTE).unwrap().balance_of(&alice).unwrap(), 1_600);
}

// ---------------------------------------------------------------------------
// Failures and retries
// ---------------------------------------------------------------------------

#[test]
fn rejected_send_keeps_escrow_until_retry() {
    let (net, _) = network();
    let alice = addr("alice");
    let home = net.vault(HOME).unwrap();
    net.transport(HOME).unwrap().reject_next(1);

    let receipt = home.dispatch_deposit(&alice, 700, REMOTE, &alice).unwrap();
    assert_eq!(receipt.status, MessageStatus::Failed);
    assert_eq!(home.summary().unwrap().escrowed, 700);
    assert_eq!(net.relay().unwrap().delivered, 0);

    let err = home.retry(&alice, receipt.nonce).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let outcome = home.retry(net.relayer(), receipt.nonce).unwrap();
    assert_eq!(
        outcome,
        RetryOutcome::Outbound {
            status: MessageStatus::Retried
        }
    );
    assert_eq!(home.summary().unwrap().escrowed, 0);

    let report = net.relay().unwrap();
    assert_eq!((report.applied, report.confirmed), (1, 1));
    assert_eq!(outbound_status(&net, HOME, &receipt.nonce), MessageStatus::Applied);
    assert_eq!(net.vault(REMOTE).unwrap().balance_of(&alice).unwrap(), 700);
}

#[test]
fn failed_inbound_stays_open_for_retry() {
    let (net, _) = network();
    let alice = addr("alice");
    let admin = net.admin().clone();
    let home = net.vault(HOME).unwrap();
    let remote = net.vault(REMOTE).unwrap();

    remote.pause(&admin).unwrap();
    let receipt = home.dispatch_deposit(&alice, 2_000, REMOTE, &alice).unwrap();
    let report = net.relay().unwrap();
    assert_eq!((report.failed, report.confirmed), (1, 0));
    match remote.message_status(&receipt.nonce).unwrap() {
        Some(MessageLookup::Inbound(record)) => {
            assert_eq!(record.status, MessageStatus::Failed);
            assert!(record.last_error.is_some());
        }
        other => panic!("expected an inbound record, got {other:?}"),
    }
    assert_eq!(remote.balance_of(&alice).unwrap(), 0);

    remote.unpause(&admin).unwrap();
    let outcome = remote.retry(net.relayer(), receipt.nonce).unwrap();
    assert!(matches!(
        outcome,
        RetryOutcome::Inbound {
            outcome: ApplyOutcome::Applied { .. }
        }
    ));
    assert_eq!(remote.balance_of(&alice).unwrap(), 2_000);
    assert!(remote.retry(net.relayer(), receipt.nonce).is_err());

    home.confirm_delivery(net.relayer(), receipt.nonce).unwrap();
    assert_eq!(outbound_status(&net, HOME, &receipt.nonce), MessageStatus::Applied);
}

#[test]
fn auto_invest_failure_does_not_undo_the_mint() {
    let (net, clock) = network();
    let alice = addr("alice");
    let remote = net.vault(REMOTE).unwrap();
    let broken = Arc::new(SimulatedStrategy::new(
        AssetId::new("USDC"),
        StrategyProfile::new("broken", 0),
        clock.clone(),
    ));
    broken.panic_on(Op::Invest);
    remote.add_strategy(net.admin(), broken, 10_000, 50).unwrap();

    let receipt = net
        .vault(HOME)
        .unwrap()
        .dispatch_deposit(&alice, 10_000, REMOTE, &alice)
        .unwrap();
    let report = net.relay().unwrap();
    assert_eq!((report.applied, report.confirmed), (1, 1));
    assert_eq!(remote.balance_of(&alice).unwrap(), 10_000);

    match remote.message_status(&receipt.nonce).unwrap() {
        Some(MessageLookup::Inbound(record)) => {
            assert_eq!(record.status, MessageStatus::Applied);
            assert!(record.follow_up_error.is_some());
        }
        other => panic!("expected an inbound record, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn forged_and_unrelayed_envelopes_are_refused() {
    let (net, _) = network();
    let alice = addr("alice");
    let remote = net.vault(REMOTE).unwrap();
    let receipt = net
        .vault(HOME)
        .unwrap()
        .dispatch_deposit(&alice, 100, REMOTE, &alice)
        .unwrap();
    let genuine = net.transport(HOME).unwrap().drain().remove(0);

    let mut inflated = genuine.clone();
    inflated.amount = 1_000_000;
    let err = remote.receive(net.relayer(), inflated).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut spoofed = genuine.clone();
    spoofed.origin_vault = addr("vault-666");
    let err = remote.receive(net.relayer(), spoofed).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = remote.receive(&alice, genuine.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    // Rejected envelopes leave no trace; the genuine one still applies.
    assert!(remote.message_status(&receipt.nonce).unwrap().is_none());
    assert!(matches!(
        remote.receive(net.relayer(), genuine).unwrap(),
        ApplyOutcome::Applied { .. }
    ));
    assert_eq!(remote.balance_of(&alice).unwrap(), 100);
}

#[test]
fn dispatch_guards() {
    let (net, _) = network();
    let alice = addr("alice");
    let home = net.vault(HOME).unwrap();

    for err in [
        home.dispatch_deposit(&alice, 100, HOME, &alice).unwrap_err(),
        home.dispatch_deposit(&alice, 100, ChainId(99), &alice).unwrap_err(),
        home.dispatch_deposit(&alice, 0, REMOTE, &alice).unwrap_err(),
        home.dispatch_withdraw(&alice, &alice, 0, REMOTE, &alice).unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    home.pause(net.admin()).unwrap();
    let err = home.dispatch_deposit(&alice, 100, REMOTE, &alice).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(net.transport(HOME).unwrap().pending(), 0);
}

// ---------------------------------------------------------------------------
// Withdraw & sync
// ---------------------------------------------------------------------------

#[test]
fn remote_withdraw_burns_where_the_shares_live() {
    let (net, _) = network();
    let alice = addr("alice");
    let remote = net.vault(REMOTE).unwrap();
    remote.deposit(&alice, 2_000, &alice).unwrap();

    let receipt = net
        .vault(HOME)
        .unwrap()
        .dispatch_withdraw(&alice, &alice, 500, REMOTE, &alice)
        .unwrap();
    net.set_redeliver(true);
    let report = net.relay().unwrap();
    assert_eq!((report.applied, report.duplicates), (1, 1));

    assert_eq!(remote.balance_of(&alice).unwrap(), 1_500);
    assert_eq!(remote.total_assets().unwrap(), 1_500);
    match remote.message_status(&receipt.nonce).unwrap() {
        Some(MessageLookup::Inbound(record)) => {
            assert_eq!(record.effect.shares_burned, 500);
            assert_eq!(record.effect.assets_released, 500);
        }
        other => panic!("expected an inbound record, got {other:?}"),
    }

    // More shares than the owner holds: recorded as failed, nothing burned.
    net.vault(HOME)
        .unwrap()
        .dispatch_withdraw(&alice, &alice, 9_999, REMOTE, &alice)
        .unwrap();
    net.set_redeliver(false);
    assert_eq!(net.relay().unwrap().failed, 1);
    assert_eq!(remote.balance_of(&alice).unwrap(), 1_500);
}

#[test]
fn remote_withdraw_only_for_the_owner() {
    let (net, _) = network();
    let alice = addr("alice");
    let mallory = addr("mallory");
    let home = net.vault(HOME).unwrap();
    let remote = net.vault(REMOTE).unwrap();
    remote.deposit(&alice, 2_000, &alice).unwrap();

    let err = home
        .dispatch_withdraw(&mallory, &alice, 2_000, REMOTE, &mallory)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert_eq!(net.transport(HOME).unwrap().pending(), 0);
    assert_eq!(net.relay().unwrap().applied, 0);
    assert_eq!(remote.balance_of(&alice).unwrap(), 2_000);
}

#[test]
fn sync_reports_totals_across_the_network() {
    let (net, clock) = network();
    let alice = addr("alice");
    let home = net.vault(HOME).unwrap();
    home.deposit(&alice, 3_000, &alice).unwrap();
    home.dispatch_deposit(&alice, 1_000, REMOTE, &alice).unwrap();
    net.relay().unwrap();
    assert_eq!(net.total_assets().unwrap(), 4_000);

    clock.advance(60);
    home.dispatch_sync(net.relayer(), REMOTE).unwrap();
    net.relay().unwrap();

    let views = net.vault(REMOTE).unwrap().remote_views().unwrap();
    assert_eq!(views.len(), 1);
    let (chain, view) = views[0];
    assert_eq!(chain, HOME);
    assert_eq!((view.total_assets, view.total_supply), (3_000, 3_000));

    let err = home.dispatch_sync(&alice, REMOTE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}
