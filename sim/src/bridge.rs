//! # In-Memory Bridge
//!
//! [`LoopbackTransport`] queues every accepted envelope instead of sending
//! it anywhere. [`SimNetwork`] owns one vault per chain, each with its own
//! transport, and [`SimNetwork::relay`] plays the relayer: it drains the
//! queues, delivers each envelope to the destination vault (optionally
//! twice) and confirms it back at the source.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use meridian_engine::access::Role;
use meridian_engine::config::VaultConfig;
use meridian_engine::crosschain::{
    BridgeProvider, BridgeRoute, BridgeTransport, CrossChainMessage, TransportError,
};
use meridian_engine::error::VaultResult;
use meridian_engine::types::{Address, AssetId, ChainId, Clock, VaultKey};
use meridian_engine::vault::ApplyOutcome;
use meridian_engine::{Vault, VaultBuilder, VaultRegistry};

// ---------------------------------------------------------------------------
// LoopbackTransport
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LoopbackTransport {
    source: ChainId,
    providers: Vec<(BridgeProvider, u64)>,
    queue: Mutex<VecDeque<CrossChainMessage>>,
    /// Number of upcoming sends to reject.
    rejecting: AtomicU32,
    accepted: AtomicU32,
}

impl LoopbackTransport {
    /// A transport offering a LayerZero and a Wormhole route to every chain.
    pub fn new(source: ChainId) -> Self {
        Self::with_providers(
            source,
            vec![
                (BridgeProvider::LayerZero, 2_000_000_000),
                (BridgeProvider::Wormhole, 800_000_000),
            ],
        )
    }

    /// A transport offering one route per `(provider, tvl_usd)`.
    pub fn with_providers(source: ChainId, providers: Vec<(BridgeProvider, u64)>) -> Self {
        Self {
            source,
            providers,
            queue: Mutex::new(VecDeque::new()),
            rejecting: AtomicU32::new(0),
            accepted: AtomicU32::new(0),
        }
    }

    /// Rejects the next `n` sends.
    pub fn reject_next(&self, n: u32) {
        self.rejecting.store(n, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Envelopes accepted since creation.
    pub fn accepted(&self) -> u32 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Takes every queued envelope, oldest first.
    pub fn drain(&self) -> Vec<CrossChainMessage> {
        self.queue.lock().drain(..).collect()
    }
}

impl BridgeTransport for LoopbackTransport {
    fn routes(&self, destination: ChainId) -> Vec<BridgeRoute> {
        self.providers
            .iter()
            .enumerate()
            .map(|(i, (provider, tvl_usd))| BridgeRoute {
                provider: provider.clone(),
                source: self.source,
                destination,
                fee: 5 + i as u64,
                estimated_secs: 120,
                tvl_usd: *tvl_usd,
                previously_exploited: false,
            })
            .collect()
    }

    fn send(&self, route: &BridgeRoute, message: &CrossChainMessage) -> Result<(), TransportError> {
        let rejected = self
            .rejecting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            tracing::debug!(nonce = %message.nonce, provider = %route.provider, "loopback send rejected");
            return Err(TransportError::Rejected("simulated outage".to_string()));
        }
        self.queue.lock().push_back(message.clone());
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SimNetwork
// ---------------------------------------------------------------------------

/// Tally of one [`SimNetwork::relay`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReport {
    pub delivered: u32,
    pub applied: u32,
    pub duplicates: u32,
    pub failed: u32,
    pub confirmed: u32,
}

/// Vaults for one asset on several chains, wired together through
/// loopback transports.
pub struct SimNetwork {
    asset: AssetId,
    admin: Address,
    relayer: Address,
    clock: Arc<dyn Clock>,
    registry: VaultRegistry,
    transports: BTreeMap<ChainId, Arc<LoopbackTransport>>,
    redeliver: AtomicBool,
}

impl SimNetwork {
    pub fn new(asset: AssetId, clock: Arc<dyn Clock>) -> VaultResult<Self> {
        Ok(Self {
            asset,
            admin: Address::parse("sim-admin")?,
            relayer: Address::parse("sim-relayer")?,
            clock,
            registry: VaultRegistry::new(),
            transports: BTreeMap::new(),
            redeliver: AtomicBool::new(false),
        })
    }

    pub fn admin(&self) -> &Address {
        &self.admin
    }

    pub fn relayer(&self) -> &Address {
        &self.relayer
    }

    /// Address of the vault on `chain`.
    pub fn vault_address(chain: ChainId) -> VaultResult<Address> {
        Ok(Address::parse(&format!("vault-{}", chain.0))?)
    }

    /// Creates the vault for `chain` and trusts it both ways with every
    /// vault already in the network.
    pub fn add_chain(&mut self, chain: ChainId, tune: impl FnOnce(&mut VaultConfig)) -> VaultResult<Arc<Vault>> {
        let mut config = VaultConfig::new(self.asset.clone(), chain);
        tune(&mut config);
        let transport = Arc::new(LoopbackTransport::new(chain));
        let vault = VaultBuilder::new(config, self.admin.clone())
            .address(Self::vault_address(chain)?)
            .clock(Arc::clone(&self.clock))
            .transport(transport.clone())
            .build()?;
        let vault = self.registry.register(vault)?;
        vault.grant_role(&self.admin, &self.relayer, Role::Relayer)?;

        for other in self.transports.keys().copied().collect::<Vec<_>>() {
            let peer = self.vault(other)?;
            peer.trust_chain(&self.admin, chain, Self::vault_address(chain)?)?;
            vault.trust_chain(&self.admin, other, Self::vault_address(other)?)?;
        }
        self.transports.insert(chain, transport);
        tracing::info!(%chain, "sim chain added");
        Ok(vault)
    }

    pub fn vault(&self, chain: ChainId) -> VaultResult<Arc<Vault>> {
        self.registry.get(&VaultKey::new(self.asset.clone(), chain))
    }

    pub fn transport(&self, chain: ChainId) -> Option<Arc<LoopbackTransport>> {
        self.transports.get(&chain).cloned()
    }

    /// Makes every later relay deliver each envelope twice.
    pub fn set_redeliver(&self, on: bool) {
        self.redeliver.store(on, Ordering::SeqCst);
    }

    /// Delivers every queued envelope and confirms the applied ones.
    pub fn relay(&self) -> VaultResult<RelayReport> {
        let mut report = RelayReport::default();
        let copies = if self.redeliver.load(Ordering::SeqCst) { 2 } else { 1 };
        for (source, transport) in &self.transports {
            for message in transport.drain() {
                let destination = self.vault(message.destination_chain)?;
                let mut applied = false;
                for _ in 0..copies {
                    report.delivered += 1;
                    match destination.receive(&self.relayer, message.clone())? {
                        ApplyOutcome::Applied { .. } => {
                            report.applied += 1;
                            applied = true;
                        }
                        ApplyOutcome::Duplicate => report.duplicates += 1,
                        ApplyOutcome::Failed { reason } => {
                            tracing::warn!(nonce = %message.nonce, %reason, "sim delivery failed");
                            report.failed += 1;
                        }
                    }
                }
                if applied {
                    self.vault(*source)?.confirm_delivery(&self.relayer, message.nonce)?;
                    report.confirmed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Total assets across every vault plus assets still on the wire.
    pub fn total_assets(&self) -> VaultResult<u64> {
        let mut total = 0u64;
        for chain in self.transports.keys() {
            total = total.saturating_add(self.vault(*chain)?.total_assets()?);
        }
        Ok(total)
    }
}
