//! Walk-through of a two-chain Meridian network.
//!
//! Two depositors enter the home vault, a strategy earns yield, a third
//! holder bridges in from a remote chain (delivered twice, minted once),
//! and everyone leaves again. Every step prints the vault's headline
//! numbers.
//!
//! Run with:
//!   cargo run -p meridian-sim --example network_demo

use std::sync::Arc;

use meridian_engine::types::{Address, AssetId, ChainId, ManualClock};
use meridian_engine::{Vault, VaultResult};
use meridian_sim::{SimNetwork, SimulatedStrategy, StrategyProfile};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";

const HOME: ChainId = ChainId(1);
const REMOTE: ChainId = ChainId(10);

fn step(n: u32, title: &str) {
    println!();
    println!("{BOLD}{CYAN}[{n}] {title}{RESET}");
}

fn show(label: &str, vault: &Vault) -> VaultResult<()> {
    let s = vault.summary()?;
    println!(
        "    {DIM}{label:<8}{RESET} assets {GREEN}{:>7}{RESET}  shares {:>7}  idle {:>7}  invested {:>7}  price {}.{:06}",
        s.total_assets,
        s.total_supply,
        s.idle,
        s.invested,
        s.share_price_micros / 1_000_000,
        s.share_price_micros % 1_000_000,
    );
    Ok(())
}

fn main() -> VaultResult<()> {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let mut network = SimNetwork::new(AssetId::new("USDC"), clock.clone())?;
    let fee_free = |c: &mut meridian_engine::config::VaultConfig| {
        c.management_fee_bps = 0;
        c.performance_fee_bps = 0;
    };
    let home = network.add_chain(HOME, fee_free)?;
    let remote = network.add_chain(REMOTE, fee_free)?;
    let admin = network.admin().clone();

    let lending = Arc::new(SimulatedStrategy::new(
        AssetId::new("USDC"),
        StrategyProfile::new("lending", 500),
        clock.clone(),
    ));
    home.add_strategy(&admin, lending.clone(), 10_000, 50)?;

    let alice = Address::parse("alice")?;
    let bob = Address::parse("bob")?;
    let carol = Address::parse("carol")?;

    step(1, "alice deposits 1000 and the vault invests it");
    let shares = home.deposit(&alice, 1_000, &alice)?;
    home.rebalance(&admin)?;
    println!("    alice holds {shares} shares");
    show("home", &home)?;

    step(2, "the strategy earns 100");
    lending.add_yield(100);
    show("home", &home)?;

    step(3, "bob deposits 1000 at the new price");
    let shares = home.deposit(&bob, 1_000, &bob)?;
    println!("    bob holds {shares} shares");
    show("home", &home)?;

    step(4, "carol bridges 500 in from chain 10; the relayer delivers twice");
    network.set_redeliver(true);
    let receipt = remote.dispatch_deposit(&carol, 500, HOME, &carol)?;
    let report = network.relay()?;
    println!(
        "    nonce {} delivered {} applied {} duplicates {}",
        receipt.nonce, report.delivered, report.applied, report.duplicates
    );
    println!("    carol holds {} shares", home.balance_of(&carol)?);
    show("home", &home)?;
    show("remote", &remote)?;

    step(5, "everyone redeems");
    for holder in [&alice, &bob, &carol] {
        let shares = home.balance_of(holder)?;
        let paid = home.redeem(holder, shares, holder, holder)?;
        println!("    {holder:<6} {shares:>5} shares -> {paid:>5}");
    }
    show("home", &home)?;
    println!();
    println!("    {DIM}network total assets: {}{RESET}", network.total_assets()?);
    Ok(())
}
