//! # Vault
//!
//! One [`Vault`] exists per (asset, chain). It owns the share ledger, the
//! strategy slots, fee and emergency state and both cross-chain message
//! ledgers, all behind a single [`CriticalSection`].
//!
//! ```text
//! state.rs       shared steps: valuation, fee settlement, liquidity, commit
//! user.rs        deposit / mint / withdraw / redeem, previews, allowances
//! admin.rs       strategies, rebalance, harvest, fees, pause, roles, trust
//! settlement.rs  dispatch, receive, retry, confirm
//! snapshot.rs    the persisted form
//! guard.rs       the critical section
//! ```
//!
//! Every mutating entry point settles the pending management fee first,
//! then runs its effect, then writes a snapshot plus every touched message
//! record to the store in one transaction. The write happens even when the
//! effect fails, so a failed inbound message or a failed send is on disk
//! before the caller sees the error.

mod admin;
mod guard;
mod settlement;
mod snapshot;
mod state;
mod user;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::access::{AccessControl, Role};
use crate::config::VaultConfig;
use crate::crosschain::{BridgeTransport, CrossChainSettlement, Inbox, Outbox, RemoteView, RouteScorer};
use crate::emergency::{EmergencyController, EmergencyState};
use crate::error::{VaultError, VaultResult};
use crate::events::EventRecord;
use crate::fees::{FeeAccrual, FeeState};
use crate::ledger::{bps_of, ShareLedger};
use crate::rebalance::RebalanceEngine;
use crate::storage::VaultStore;
use crate::strategy::{AllocationChange, BadDebt, SlotRecord, Strategy, StrategyAllocator, StrategyId, StrategySlot};
use crate::types::{Address, AssetId, ChainId, Clock, SystemClock, VaultKey};

pub use admin::HarvestReport;
pub use guard::CriticalSection;
pub use settlement::{ApplyOutcome, DispatchReceipt, RetryOutcome};
pub use snapshot::{Flows, VaultSnapshot, SNAPSHOT_VERSION};

use state::VaultState;

/// Re-attaches live strategy handles when a vault is restored from a
/// snapshot. Called with the slot's id and name.
pub type StrategyResolver = Arc<dyn Fn(StrategyId, &str) -> Option<Arc<dyn Strategy>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

/// A strategy slot as seen by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub record: SlotRecord,
    pub current_assets: u64,
    /// `None` when the strategy failed to report.
    pub apy_bps: Option<u64>,
    /// Current target at the slot's allocation.
    pub target_assets: u64,
}

/// Headline numbers of one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSummary {
    pub asset: AssetId,
    pub chain: ChainId,
    pub address: Address,
    pub total_assets: u64,
    pub total_supply: u64,
    pub idle: u64,
    pub invested: u64,
    /// Outbound deposit assets not yet accepted by a bridge.
    pub escrowed: u64,
    /// Assets per whole share, in millionths.
    pub share_price_micros: u64,
    pub emergency: EmergencyState,
    pub strategies: usize,
    pub holders: usize,
    pub bad_debt: u64,
    pub fees: FeeState,
    pub flows: Flows,
    pub inbound_processed: usize,
    pub inbound_failed: usize,
    pub inbound_duplicates: u64,
    pub outbound_unconfirmed: usize,
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

pub struct Vault {
    key: VaultKey,
    address: Address,
    clock: Arc<dyn Clock>,
    section: CriticalSection<VaultState>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("key", &self.key)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Runs a state-changing operation and commits the result.
    fn mutate<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut VaultState, u64) -> VaultResult<R>,
    ) -> VaultResult<R> {
        let now = self.clock.now();
        self.section.enter(op, |state| {
            let result = f(state, now);
            match (result, state.commit(now)) {
                (Ok(value), Ok(())) => Ok(value),
                (Ok(_), Err(e)) => {
                    tracing::error!(op, vault = %self.key, error = %e, "commit failed");
                    Err(e)
                }
                (Err(e), Ok(())) => {
                    tracing::debug!(op, vault = %self.key, error = %e, "operation rejected");
                    Err(e)
                }
                (Err(e), Err(commit)) => {
                    tracing::error!(op, vault = %self.key, error = %commit, "commit after failed operation failed");
                    Err(e)
                }
            }
        })
    }

    /// Runs a query. Slot valuations may refresh; nothing is committed.
    fn read<R>(&self, op: &'static str, f: impl FnOnce(&mut VaultState, u64) -> VaultResult<R>) -> VaultResult<R> {
        let now = self.clock.now();
        self.section.enter(op, |state| f(state, now))
    }

    pub fn key(&self) -> &VaultKey {
        &self.key
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    // -- Queries -------------------------------------------------------------

    pub fn config(&self) -> VaultResult<VaultConfig> {
        self.read("config", |s, _| Ok(s.config.clone()))
    }

    pub fn total_assets(&self) -> VaultResult<u64> {
        self.read("total_assets", |s, _| Ok(s.total_assets()))
    }

    pub fn total_supply(&self) -> VaultResult<u64> {
        self.read("total_supply", |s, _| Ok(s.ledger.total_supply()))
    }

    pub fn balance_of(&self, holder: &Address) -> VaultResult<u64> {
        self.read("balance_of", |s, _| Ok(s.ledger.balance_of(holder)))
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> VaultResult<u64> {
        self.read("allowance", |s, _| Ok(s.ledger.allowance(owner, spender)))
    }

    /// Assets per whole share in millionths, pending fee included.
    pub fn share_price(&self) -> VaultResult<u64> {
        self.read("share_price", |s, now| Ok(s.effective_rate(now)?.price_micros()))
    }

    pub fn idle(&self) -> VaultResult<u64> {
        self.read("idle", |s, _| Ok(s.idle))
    }

    pub fn strategies(&self) -> VaultResult<Vec<StrategyInfo>> {
        self.read("strategies", |s, _| {
            let total_assets = s.total_assets();
            Ok(s.allocator
                .slots_mut()
                .map(|slot| {
                    let current_assets = slot.assets_or_last_known();
                    StrategyInfo {
                        current_assets,
                        apy_bps: slot.apy_bps(),
                        target_assets: bps_of(total_assets, slot.record.allocation_bps),
                        record: slot.record.clone(),
                    }
                })
                .collect())
        })
    }

    pub fn summary(&self) -> VaultResult<VaultSummary> {
        self.read("summary", |s, now| {
            let invested = s.allocator.invested_assets();
            let rate = s.effective_rate(now)?;
            let inbox = s.settlement.inbox();
            let outbox = s.settlement.outbox();
            Ok(VaultSummary {
                asset: s.config.asset.clone(),
                chain: s.config.chain,
                address: s.address.clone(),
                total_assets: s.idle.saturating_add(invested),
                total_supply: s.ledger.total_supply(),
                idle: s.idle,
                invested,
                escrowed: outbox.escrowed(),
                share_price_micros: rate.price_micros(),
                emergency: s.emergency.state(),
                strategies: s.allocator.len(),
                holders: s.ledger.holder_count(),
                bad_debt: s.allocator.total_bad_debt(),
                fees: s.fees.state().clone(),
                flows: s.flows,
                inbound_processed: inbox.processed_count(),
                inbound_failed: inbox.failed_count(),
                inbound_duplicates: inbox.duplicates(),
                outbound_unconfirmed: outbox.unconfirmed(),
            })
        })
    }

    pub fn snapshot(&self) -> VaultResult<VaultSnapshot> {
        self.read("snapshot", |s, now| Ok(s.snapshot(now)))
    }

    /// Writes the current state to the store, if one is attached.
    pub fn persist(&self) -> VaultResult<()> {
        self.mutate("persist", |_, _| Ok(()))
    }

    /// Takes every buffered event, oldest first.
    pub fn drain_events(&self) -> VaultResult<Vec<EventRecord>> {
        self.read("drain_events", |s, _| Ok(s.events.drain()))
    }

    pub fn emergency_state(&self) -> VaultResult<EmergencyState> {
        self.read("emergency_state", |s, _| Ok(s.emergency.state()))
    }

    pub fn bad_debt(&self) -> VaultResult<Vec<BadDebt>> {
        self.read("bad_debt", |s, _| Ok(s.allocator.bad_debt()))
    }

    pub fn allocation_history(&self) -> VaultResult<Vec<AllocationChange>> {
        self.read("allocation_history", |s, _| Ok(s.allocator.history().to_vec()))
    }

    pub fn roles_of(&self, account: &Address) -> VaultResult<Vec<Role>> {
        self.read("roles_of", |s, _| Ok(s.access.roles_of(account)))
    }

    pub fn remote_views(&self) -> VaultResult<Vec<(ChainId, RemoteView)>> {
        self.read("remote_views", |s, _| {
            Ok(s.settlement
                .remote_views()
                .iter()
                .map(|(chain, view)| (*chain, *view))
                .collect())
        })
    }

    pub fn fee_state(&self) -> VaultResult<FeeState> {
        self.read("fee_state", |s, _| Ok(s.fees.state().clone()))
    }

    pub fn flows(&self) -> VaultResult<Flows> {
        self.read("flows", |s, _| Ok(s.flows))
    }
}

// ---------------------------------------------------------------------------
// VaultBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`Vault`], restoring it from the store when a snapshot for
/// its key exists there.
pub struct VaultBuilder {
    config: VaultConfig,
    admin: Address,
    address: Option<Address>,
    clock: Arc<dyn Clock>,
    transport: Option<Arc<dyn BridgeTransport>>,
    scorer: Option<Arc<dyn RouteScorer>>,
    store: Option<VaultStore>,
    fee_recipient: Option<Address>,
    resolver: Option<StrategyResolver>,
}

impl VaultBuilder {
    pub fn new(config: VaultConfig, admin: Address) -> Self {
        Self {
            config,
            admin,
            address: None,
            clock: Arc::new(SystemClock),
            transport: None,
            scorer: None,
            store: None,
            fee_recipient: None,
            resolver: None,
        }
    }

    /// Address remote vaults know this vault by. Defaults to
    /// `vault:<asset>:<chain>`.
    pub fn address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn BridgeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn RouteScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn store(mut self, store: VaultStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Ignored when restoring; the persisted recipient wins.
    pub fn fee_recipient(mut self, recipient: Address) -> Self {
        self.fee_recipient = Some(recipient);
        self
    }

    pub fn resolver(
        mut self,
        resolver: impl Fn(StrategyId, &str) -> Option<Arc<dyn Strategy>> + Send + Sync + 'static,
    ) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn build(self) -> VaultResult<Vault> {
        self.config.validate()?;
        let key = VaultKey::new(self.config.asset.clone(), self.config.chain);
        let address = match &self.address {
            Some(address) => address.clone(),
            None => Address::parse(&format!("vault:{}:{}", self.config.asset, self.config.chain.0))?,
        };
        let now = self.clock.now();

        let mut settlement = CrossChainSettlement::new(self.config.chain);
        if let Some(transport) = self.transport.clone() {
            settlement = settlement.with_transport(transport);
        }
        if let Some(scorer) = self.scorer.clone() {
            settlement = settlement.with_scorer(scorer);
        }

        let snapshot = match &self.store {
            Some(store) => store.load_snapshot(&key)?,
            None => None,
        };
        let mut state = match snapshot {
            Some(snapshot) => self.restore(key.clone(), address.clone(), snapshot, settlement)?,
            None => self.fresh(key.clone(), address.clone(), settlement, now)?,
        };
        state.commit(now)?;

        Ok(Vault {
            key,
            address,
            clock: self.clock,
            section: CriticalSection::new(state),
        })
    }

    fn fresh(
        &self,
        key: VaultKey,
        address: Address,
        settlement: CrossChainSettlement,
        now: u64,
    ) -> VaultResult<VaultState> {
        let config = self.config.clone();
        let fees = FeeAccrual::new(
            config.management_fee_bps,
            config.performance_fee_bps,
            self.fee_recipient.clone(),
            now,
        )?;
        tracing::info!(vault = %key, %address, admin = %self.admin, "vault created");
        Ok(VaultState::new(
            key,
            address,
            config.clone(),
            AccessControl::with_admin(self.admin.clone()),
            ShareLedger::new(),
            0,
            StrategyAllocator::new(config.asset.clone(), config.max_strategies),
            fees,
            EmergencyController::new(),
            RebalanceEngine::new(config.min_rebalance_interval_secs),
            settlement,
            Flows::default(),
            self.store.clone(),
        ))
    }

    fn restore(
        &self,
        key: VaultKey,
        address: Address,
        snapshot: VaultSnapshot,
        mut settlement: CrossChainSettlement,
    ) -> VaultResult<VaultState> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(VaultError::Restore(format!(
                "snapshot version {} is not supported",
                snapshot.version
            )));
        }
        if snapshot.ledger.sum_of_balances() != snapshot.ledger.total_supply() as u128 {
            return Err(VaultError::Restore("share balances do not add up to supply".to_string()));
        }
        let reported_assets = snapshot.reported_total_assets();
        if snapshot.address != address {
            tracing::warn!(persisted = %snapshot.address, configured = %address, "vault address changed");
        }

        let resolve = |id: StrategyId, name: &str| self.resolver.as_ref().and_then(|r| r(id, name));
        let mut slots = Vec::with_capacity(snapshot.slots.len());
        for record in snapshot.slots {
            match resolve(record.id, &record.name) {
                Some(handle) => slots.push(StrategySlot::new(record, handle)),
                None if record.last_reported_assets > 0 => {
                    return Err(VaultError::Restore(format!(
                        "no handle for strategy {} ({}) holding {}",
                        record.id, record.name, record.last_reported_assets
                    )))
                }
                None => {
                    tracing::warn!(strategy = %record.id, name = %record.name, "empty strategy slot dropped on restore")
                }
            }
        }
        let bad_debt = snapshot
            .bad_debt
            .into_iter()
            .map(|entry| {
                let handle = resolve(entry.strategy, &entry.name);
                (entry, handle)
            })
            .collect();

        let config = snapshot.config;
        let allocator = StrategyAllocator::from_parts(
            config.asset.clone(),
            config.max_strategies,
            slots,
            snapshot.next_strategy_id,
            snapshot.allocation_history,
            bad_debt,
        );

        let (inbox, outbox) = match &self.store {
            Some(store) => (
                Inbox::from_records(store.load_inbound(&key)?, snapshot.inbound_duplicates),
                Outbox::from_records(store.load_outbound(&key)?),
            ),
            None => (Inbox::new(), Outbox::new()),
        };
        tracing::info!(
            vault = %key,
            supply = snapshot.ledger.total_supply(),
            reported_assets,
            inbound = inbox.processed_count(),
            outbound = outbox.len(),
            "vault restored"
        );
        settlement.restore(
            snapshot.trusted_chains.into_iter().collect::<BTreeMap<_, _>>(),
            inbox,
            outbox,
            snapshot.remote_views.into_iter().collect::<BTreeMap<_, _>>(),
        );

        let rebalancer =
            RebalanceEngine::with_last_rebalance(config.min_rebalance_interval_secs, snapshot.last_rebalance_at);
        Ok(VaultState::new(
            key,
            address,
            config,
            snapshot.access,
            snapshot.ledger,
            snapshot.idle,
            allocator,
            FeeAccrual::from_state(snapshot.fees),
            EmergencyController::from_state(snapshot.emergency, snapshot.shutdown_at),
            rebalancer,
            settlement,
            snapshot.flows,
            self.store.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::VaultConfig;
    use crate::crosschain::{CrossChainMessage, MessageKind};
    use crate::error::ErrorKind;
    use crate::strategy::testing::MockStrategy;
    use crate::types::ManualClock;

    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn config() -> VaultConfig {
        let mut cfg = VaultConfig::new(AssetId::new("USDC"), ChainId(1));
        cfg.management_fee_bps = 0;
        cfg
    }

    #[test]
    fn default_address_names_asset_and_chain() {
        let vault = VaultBuilder::new(config(), addr("admin")).build().unwrap();
        assert_eq!(vault.address().as_str(), "vault:USDC:1");
        assert_eq!(vault.key().to_string(), "USDC@1");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = config();
        cfg.max_slippage_bps = 10_001;
        let err = VaultBuilder::new(cfg, addr("admin")).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn restore_keeps_balances_and_nonces() {
        let store = VaultStore::open_temporary().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let strategy = Arc::new(MockStrategy::new("USDC"));
        let admin = addr("admin");
        let alice = addr("alice");

        let message = CrossChainMessage::new(
            MessageKind::Deposit,
            addr("bob"),
            addr("bob"),
            500,
            ChainId(10),
            ChainId(1),
            addr("vault-10"),
            900,
        );
        let before = {
            let vault = VaultBuilder::new(config(), admin.clone())
                .clock(clock.clone())
                .store(store.clone())
                .build()
                .unwrap();
            vault.add_strategy(&admin, strategy.clone(), 5_000, 50).unwrap();
            vault.trust_chain(&admin, ChainId(10), addr("vault-10")).unwrap();
            vault.deposit(&alice, 10_000, &alice).unwrap();
            vault.rebalance(&admin).unwrap();
            vault.receive(&admin, message.clone()).unwrap();
            vault.summary().unwrap()
        };

        let handle: Arc<dyn Strategy> = strategy.clone();
        let vault = VaultBuilder::new(config(), admin.clone())
            .clock(clock)
            .store(store)
            .resolver(move |_, _| Some(handle.clone()))
            .build()
            .unwrap();
        assert_eq!(vault.summary().unwrap(), before);
        assert_eq!(vault.balance_of(&alice).unwrap(), 10_000);
        assert_eq!(vault.receive(&admin, message).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(vault.strategies().unwrap()[0].current_assets, 5_000);
    }

    #[test]
    fn funded_slot_without_handle_blocks_restore() {
        let store = VaultStore::open_temporary().unwrap();
        let admin = addr("admin");
        {
            let vault = VaultBuilder::new(config(), admin.clone())
                .store(store.clone())
                .build()
                .unwrap();
            vault
                .add_strategy(&admin, Arc::new(MockStrategy::new("USDC")), 5_000, 50)
                .unwrap();
            vault.deposit(&admin, 1_000, &admin).unwrap();
            vault.rebalance(&admin).unwrap();
        }
        let err = VaultBuilder::new(config(), admin)
            .store(store)
            .build()
            .unwrap_err();
        assert!(matches!(err, VaultError::Restore(_)));
    }
}
