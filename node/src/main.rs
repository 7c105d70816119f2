// Copyright (c) 2026 Meridian Contributors. MIT License.
// See LICENSE for details.

//! # Meridian Node
//!
//! Entry point for the `meridian-node` binary. Parses CLI arguments,
//! initializes logging and metrics, opens (or restores) the hosted vault,
//! runs its upkeep ticks and serves the HTTP/WS API.
//!
//! Subcommands:
//!
//! - `run`: start the node
//! - `init`: create the data directory and a default config
//! - `status`: query a running node's status endpoint
//! - `version`: print build version information

mod api;
mod cli;
mod config;
mod logging;
mod metrics;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;

use meridian_engine::storage::VaultStore;
use meridian_engine::strategy::Strategy;
use meridian_engine::types::{Address, Clock, SystemClock};
use meridian_engine::{ErrorKind, Vault, VaultBuilder};
use meridian_sim::{LoopbackTransport, SimulatedStrategy};

use api::AppState;
use cli::{Commands, MeridianNodeCli};
use config::{NodeConfig, CONFIG_FILE_NAME};
use metrics::NodeMetrics;

/// Broadcast capacity for live event streaming.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = MeridianNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn load_config(args: &cli::RunArgs) -> Result<NodeConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| args.data_dir.join(CONFIG_FILE_NAME));
    if path.exists() {
        tracing::info!(path = %path.display(), "loading config");
        NodeConfig::load(&path)
    } else if args.config.is_some() {
        anyhow::bail!("config file {} does not exist", path.display())
    } else {
        tracing::warn!(path = %path.display(), "no config file, using devnet defaults");
        NodeConfig::devnet()
    }
}

/// Opens the vault, restoring it from the store when a snapshot exists.
/// Strategies are simulated and keyed by name, so a restored slot finds
/// its handle again through the resolver.
fn open_vault(
    config: &NodeConfig,
    store: VaultStore,
    transport: Arc<LoopbackTransport>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<Vault>> {
    let handles: HashMap<String, Arc<SimulatedStrategy>> = config
        .strategies
        .iter()
        .map(|entry| {
            let strategy = SimulatedStrategy::new(config.vault.asset.clone(), entry.profile.clone(), clock.clone());
            (entry.profile.name.clone(), Arc::new(strategy))
        })
        .collect();
    let resolver_handles = handles.clone();

    let mut builder = VaultBuilder::new(config.vault.clone(), config.admin.clone())
        .clock(clock)
        .transport(transport)
        .store(store)
        .resolver(move |_, name| {
            resolver_handles
                .get(name)
                .map(|s| Arc::clone(s) as Arc<dyn Strategy>)
        });
    if let Some(address) = &config.vault_address {
        builder = builder.address(address.clone());
    }
    if let Some(recipient) = &config.fee_recipient {
        builder = builder.fee_recipient(recipient.clone());
    }
    let vault = builder.build().context("failed to open vault")?;

    // Apply the config on top of whatever was restored.
    let admin = &config.admin;
    for grant in &config.roles {
        vault
            .grant_role(admin, &grant.account, grant.role)
            .with_context(|| format!("failed to grant {:?} to {}", grant.role, grant.account))?;
    }
    for trusted in &config.trusted_chains {
        vault
            .trust_chain(admin, trusted.chain, trusted.vault.clone())
            .with_context(|| format!("failed to trust chain {}", trusted.chain.0))?;
    }
    let existing: Vec<String> = vault.strategies()?.into_iter().map(|s| s.record.name).collect();
    for entry in &config.strategies {
        if existing.contains(&entry.profile.name) {
            continue;
        }
        let Some(handle) = handles.get(&entry.profile.name) else {
            continue;
        };
        let id = vault
            .add_strategy(admin, handle.clone(), entry.allocation_bps, entry.max_loss_bps)
            .with_context(|| format!("failed to add strategy {}", entry.profile.name))?;
        tracing::info!(strategy = %id, name = %entry.profile.name, "strategy registered");
    }
    Ok(Arc::new(vault))
}

/// Starts the node: API server, metrics endpoint and upkeep ticks.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_DIRECTIVES, args.log_format);

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting meridian-node"
    );

    let config = load_config(&args)?;

    // --- Persistent storage ---
    let store_path = args.data_dir.join("store");
    std::fs::create_dir_all(&store_path)
        .with_context(|| format!("failed to create store directory: {}", store_path.display()))?;
    let store = VaultStore::open(&store_path)
        .with_context(|| format!("failed to open store at {}", store_path.display()))?;
    tracing::info!(path = %store_path.display(), "store opened");

    // --- Vault ---
    let transport = Arc::new(LoopbackTransport::new(config.vault.chain));
    let vault = open_vault(&config, store, transport.clone(), Arc::new(SystemClock))?;

    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let app_state = AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        vault: Arc::clone(&vault),
        transport,
        event_tx,
        metrics: Arc::clone(&node_metrics),
    };
    api::publish(&app_state);

    // --- API server ---
    let api_router = api::create_router(app_state.clone());
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Upkeep ---
    let harvest_loop = tokio::spawn(harvest_ticks(
        app_state.clone(),
        config.admin.clone(),
        Duration::from_secs(args.harvest_interval_secs.max(1)),
    ));
    let rebalance_loop = tokio::spawn(rebalance_ticks(
        app_state.clone(),
        config.admin.clone(),
        Duration::from_secs(args.rebalance_interval_secs.max(1)),
    ));

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    harvest_loop.abort();
    rebalance_loop.abort();
    vault.persist().context("failed to write final snapshot")?;
    tracing::info!("meridian-node stopped");
    Ok(())
}

/// Harvests every strategy and settles the management fee on each tick.
/// Vault calls block on the vault lock and on strategies, so each tick
/// runs on the blocking pool.
async fn harvest_ticks(state: AppState, admin: Address, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let (tick_state, tick_admin) = (state.clone(), admin.clone());
        if let Err(e) = tokio::task::spawn_blocking(move || harvest_once(&tick_state, &tick_admin)).await {
            tracing::error!(error = %e, "harvest tick aborted");
        }
    }
}

fn harvest_once(state: &AppState, admin: &Address) {
    match state.vault.harvest_all(admin) {
        Ok(report) => {
            state
                .metrics
                .strategy_failures_total
                .inc_by(report.failures.len() as u64);
            tracing::debug!(harvested = report.harvested, "harvest tick");
        }
        Err(e) if e.kind() == ErrorKind::InvalidState => {
            tracing::debug!(error = %e, "harvest skipped");
        }
        Err(e) => tracing::warn!(error = %e, "harvest tick failed"),
    }
    if let Err(e) = state.vault.collect_fees(admin) {
        tracing::debug!(error = %e, "fee collection skipped");
    }
    api::publish(state);
}

/// Attempts a full rebalance on each tick. Cooldown and pause refusals are
/// expected and only logged at debug.
async fn rebalance_ticks(state: AppState, admin: Address, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let (tick_state, tick_admin) = (state.clone(), admin.clone());
        if let Err(e) = tokio::task::spawn_blocking(move || rebalance_once(&tick_state, &tick_admin)).await {
            tracing::error!(error = %e, "rebalance tick aborted");
        }
    }
}

fn rebalance_once(state: &AppState, admin: &Address) {
    match state.vault.rebalance(admin) {
        Ok(report) => {
            state
                .metrics
                .strategy_failures_total
                .inc_by(report.failures.len() as u64);
            tracing::info!(
                withdrawn = report.withdrawn,
                deposited = report.deposited,
                shortfall = report.shortfall,
                "rebalance tick"
            );
        }
        Err(e) if e.kind() == ErrorKind::InvalidState => {
            tracing::debug!(error = %e, "rebalance skipped");
        }
        Err(e) => tracing::warn!(error = %e, "rebalance tick failed"),
    }
    api::publish(state);
}

/// Creates the data directory and writes the devnet config into it.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("meridian_node=info", logging::LogFormat::Pretty);

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let path = data_dir.join(CONFIG_FILE_NAME);
    if path.exists() && !args.force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = NodeConfig::devnet()?;
    config.write(&path)?;
    tracing::info!(path = %path.display(), "config written");

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", path.display());
    println!("  Vault          : {} on chain {}", config.vault.asset, config.vault.chain.0);
    println!("  Strategies     : {}", config.strategies.len());

    Ok(())
}

/// Queries a running node's status endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let body = http_get(&url).await?;
    println!("{}", body);
    Ok(())
}

/// Plain HTTP/1.1 GET over a tokio TCP stream.
async fn http_get(url: &str) -> Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| anyhow::anyhow!("only http:// URLs are supported: {}", url))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let addr = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{}:80", authority)
    };

    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, authority,
    );
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);
    Ok(response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_else(|| response.to_string()))
}

fn print_version() {
    println!("meridian-node {}", env!("CARGO_PKG_VERSION"));
    println!("snapshot      v{}", meridian_engine::vault::SNAPSHOT_VERSION);
    println!("rustc         {}", option_env!("RUSTC_VERSION").unwrap_or("unknown"));
}

/// Waits for SIGINT or SIGTERM, whichever comes first. Only Ctrl+C on
/// non-Unix platforms.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use meridian_engine::config::VaultConfig;
    use meridian_engine::events::VaultEvent;
    use meridian_engine::types::{AssetId, ChainId, ManualClock};
    use meridian_sim::StrategyProfile;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rebalance_tick_runs_and_publishes() {
        let mut config = VaultConfig::new(AssetId::new("USDC"), ChainId(1));
        config.management_fee_bps = 0;
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let admin = Address::parse("admin").unwrap();
        let vault = VaultBuilder::new(config, admin.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        let strategy = SimulatedStrategy::new(AssetId::new("USDC"), StrategyProfile::new("lend", 0), clock);
        vault.add_strategy(&admin, Arc::new(strategy), 10_000, 50).unwrap();
        let alice = Address::parse("alice").unwrap();
        vault.deposit(&alice, 1_000, &alice).unwrap();
        vault.drain_events().unwrap();

        let (event_tx, mut events) = broadcast::channel(64);
        let state = AppState {
            version: "test".into(),
            vault: Arc::new(vault),
            transport: Arc::new(LoopbackTransport::new(ChainId(1))),
            event_tx,
            metrics: Arc::new(NodeMetrics::new().unwrap()),
        };
        let ticks = tokio::spawn(rebalance_ticks(state.clone(), admin, Duration::from_millis(10)));

        let record = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        ticks.abort();
        assert!(matches!(record.event, VaultEvent::Rebalanced { deposited: 750, .. }));
        assert_eq!(state.vault.idle().unwrap(), 0);
    }
}
