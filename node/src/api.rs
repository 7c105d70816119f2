//! # REST + WebSocket API
//!
//! Builds the axum router over the hosted vault. Handlers call straight
//! into [`Vault`]; after every call the buffered vault events are drained,
//! counted and pushed to WebSocket subscribers.
//!
//! ## Endpoints
//!
//! | Method | Path                      | Description                              |
//! |--------|---------------------------|------------------------------------------|
//! | GET    | `/health`                 | Liveness probe                           |
//! | GET    | `/status`                 | Node and vault headline                  |
//! | GET    | `/vault`                  | Full vault summary                       |
//! | GET    | `/strategies`             | Strategy slots with live valuations      |
//! | GET    | `/balances/:holder`       | Shares and redeemable assets of a holder |
//! | GET    | `/messages/:nonce`        | Cross-chain message status               |
//! | POST   | `/deposit`, `/mint`       | Enter the vault                          |
//! | POST   | `/withdraw`, `/redeem`    | Leave the vault                          |
//! | POST   | `/emergency-withdraw`     | Pro-rata exit during shutdown            |
//! | POST   | `/admin/*`                | Rebalance, harvest, pause, shutdown      |
//! | POST   | `/bridge/*`               | Dispatch, relay, confirm, retry          |
//! | GET    | `/bridge/outbox`          | Take messages waiting for a relayer      |
//! | GET    | `/ws`                     | Live vault event stream                  |
//!
//! Callers identify themselves in the request body. Authorization is the
//! vault's own role table.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use meridian_engine::crosschain::{CrossChainMessage, Nonce};
use meridian_engine::emergency::EmergencyState;
use meridian_engine::events::EventRecord;
use meridian_engine::rebalance::RebalanceReport;
use meridian_engine::types::{Address, AssetId, ChainId};
use meridian_engine::vault::HarvestReport;
use meridian_engine::{ErrorKind, Vault, VaultError, VaultResult};
use meridian_sim::LoopbackTransport;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state of every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub vault: Arc<Vault>,
    /// Outbound bridge queue, emptied by `GET /bridge/outbox`.
    pub transport: Arc<LoopbackTransport>,
    pub event_tx: broadcast::Sender<EventRecord>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/vault", get(vault_handler))
        .route("/strategies", get(strategies_handler))
        .route("/balances/:holder", get(balance_handler))
        .route("/messages/:nonce", get(message_handler))
        .route("/deposit", post(deposit_handler))
        .route("/mint", post(mint_handler))
        .route("/withdraw", post(withdraw_handler))
        .route("/redeem", post(redeem_handler))
        .route("/emergency-withdraw", post(emergency_withdraw_handler))
        .route("/admin/rebalance", post(rebalance_handler))
        .route("/admin/harvest", post(harvest_handler))
        .route("/admin/pause", post(pause_handler))
        .route("/admin/unpause", post(unpause_handler))
        .route("/admin/shutdown", post(shutdown_handler))
        .route("/bridge/deposit", post(bridge_deposit_handler))
        .route("/bridge/withdraw", post(bridge_withdraw_handler))
        .route("/bridge/inbound", post(inbound_handler))
        .route("/bridge/confirm", post(confirm_handler))
        .route("/bridge/retry", post(retry_handler))
        .route("/bridge/outbox", get(outbox_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn bad_request(error: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse {
                error: error.to_string(),
                kind: Some(ErrorKind::Validation),
            },
        }
    }

    fn not_found(error: impl ToString) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorResponse {
                error: error.to_string(),
                kind: None,
            },
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Capacity | ErrorKind::Reentrancy => StatusCode::CONFLICT,
        ErrorKind::InsufficientFunds | ErrorKind::SlippageExceeded => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::InvalidState => StatusCode::LOCKED,
        ErrorKind::StrategyFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        let kind = e.kind();
        Self {
            status: status_for(kind),
            body: ErrorResponse {
                error: e.to_string(),
                kind: Some(kind),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Event fan-out
// ---------------------------------------------------------------------------

/// Drains the vault's event buffer into metrics and the broadcast channel,
/// then refreshes the summary gauges.
pub fn publish(state: &AppState) {
    match state.vault.drain_events() {
        Ok(records) => {
            for record in records {
                state.metrics.observe_event(&record);
                // No subscribers is fine.
                let _ = state.event_tx.send(record);
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to drain vault events"),
    }
    match state.vault.summary() {
        Ok(summary) => state.metrics.observe_summary(&summary),
        Err(e) => tracing::warn!(error = %e, "failed to read vault summary"),
    }
}

/// Runs one vault operation, timed, and publishes what it emitted.
/// Events are published on failure too: a slippage rejection emits one.
fn call<R>(state: &AppState, op: impl FnOnce(&Vault) -> VaultResult<R>) -> ApiResult<R> {
    let started = Instant::now();
    let result = op(&state.vault);
    state
        .metrics
        .request_latency_seconds
        .observe(started.elapsed().as_secs_f64());
    publish(state);
    result.map(Json).map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub asset: AssetId,
    pub chain: ChainId,
    pub address: Address,
    pub emergency: EmergencyState,
    pub total_assets: u64,
    pub total_supply: u64,
    /// Outbound messages waiting for a relayer.
    pub outbox_pending: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub holder: Address,
    pub shares: u64,
    pub assets: u64,
    pub max_withdraw: u64,
    pub max_redeem: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssetsRequest {
    pub caller: Address,
    pub assets: u64,
    /// Defaults to the caller.
    #[serde(default)]
    pub receiver: Option<Address>,
    /// Defaults to the caller. Only read by `/withdraw`.
    #[serde(default)]
    pub owner: Option<Address>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SharesRequest {
    pub caller: Address,
    pub shares: u64,
    #[serde(default)]
    pub receiver: Option<Address>,
    #[serde(default)]
    pub owner: Option<Address>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmergencyWithdrawRequest {
    pub owner: Address,
    pub shares: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminRequest {
    pub caller: Address,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeDepositRequest {
    pub sender: Address,
    pub assets: u64,
    pub destination: ChainId,
    #[serde(default)]
    pub receiver: Option<Address>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeWithdrawRequest {
    pub caller: Address,
    pub shares: u64,
    pub destination: ChainId,
    #[serde(default)]
    pub receiver: Option<Address>,
    /// Defaults to `caller`.
    #[serde(default)]
    pub owner: Option<Address>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InboundRequest {
    pub relayer: Address,
    pub message: CrossChainMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NonceRequest {
    pub relayer: Address,
    pub nonce: Nonce,
}

// ---------------------------------------------------------------------------
// Read handlers
// ---------------------------------------------------------------------------

/// `GET /health`. Does not touch the vault.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let summary = state.vault.summary()?;
    Ok(Json(StatusResponse {
        version: state.version.clone(),
        asset: summary.asset,
        chain: summary.chain,
        address: summary.address,
        emergency: summary.emergency,
        total_assets: summary.total_assets,
        total_supply: summary.total_supply,
        outbox_pending: state.transport.pending(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

async fn vault_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.vault.summary().map(Json).map_err(ApiError::from)
}

async fn strategies_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.vault.strategies().map(Json).map_err(ApiError::from)
}

async fn balance_handler(
    Path(holder): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<BalanceResponse> {
    let holder = Address::parse(&holder).map_err(ApiError::bad_request)?;
    let shares = state.vault.balance_of(&holder)?;
    Ok(Json(BalanceResponse {
        assets: state.vault.convert_to_assets(shares)?,
        max_withdraw: state.vault.max_withdraw(&holder)?,
        max_redeem: state.vault.max_redeem(&holder)?,
        shares,
        holder,
    }))
}

/// `GET /messages/:nonce`. The nonce is 64 hex characters.
async fn message_handler(Path(nonce): Path<String>, State(state): State<AppState>) -> Response {
    let nonce = match Nonce::from_hex(&nonce) {
        Ok(nonce) => nonce,
        Err(e) => return ApiError::bad_request(format!("malformed nonce: {e}")).into_response(),
    };
    match state.vault.message_status(&nonce) {
        Ok(Some(lookup)) => Json(lookup).into_response(),
        Ok(None) => ApiError::not_found(format!("no message with nonce {nonce}")).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// User handlers
// ---------------------------------------------------------------------------

async fn deposit_handler(State(state): State<AppState>, Json(req): Json<AssetsRequest>) -> ApiResult<u64> {
    let receiver = req.receiver.unwrap_or_else(|| req.caller.clone());
    call(&state, |v| v.deposit(&req.caller, req.assets, &receiver))
}

async fn mint_handler(State(state): State<AppState>, Json(req): Json<SharesRequest>) -> ApiResult<u64> {
    let receiver = req.receiver.unwrap_or_else(|| req.caller.clone());
    call(&state, |v| v.mint(&req.caller, req.shares, &receiver))
}

async fn withdraw_handler(State(state): State<AppState>, Json(req): Json<AssetsRequest>) -> ApiResult<u64> {
    let receiver = req.receiver.unwrap_or_else(|| req.caller.clone());
    let owner = req.owner.unwrap_or_else(|| req.caller.clone());
    call(&state, |v| v.withdraw(&req.caller, req.assets, &receiver, &owner))
}

async fn redeem_handler(State(state): State<AppState>, Json(req): Json<SharesRequest>) -> ApiResult<u64> {
    let receiver = req.receiver.unwrap_or_else(|| req.caller.clone());
    let owner = req.owner.unwrap_or_else(|| req.caller.clone());
    call(&state, |v| v.redeem(&req.caller, req.shares, &receiver, &owner))
}

async fn emergency_withdraw_handler(
    State(state): State<AppState>,
    Json(req): Json<EmergencyWithdrawRequest>,
) -> ApiResult<u64> {
    call(&state, |v| v.emergency_withdraw(&req.owner, req.shares))
}

// ---------------------------------------------------------------------------
// Admin handlers
// ---------------------------------------------------------------------------

async fn rebalance_handler(
    State(state): State<AppState>,
    Json(req): Json<AdminRequest>,
) -> ApiResult<RebalanceReport> {
    let report = call(&state, |v| v.rebalance(&req.caller))?;
    state.metrics.strategy_failures_total.inc_by(report.failures.len() as u64);
    Ok(report)
}

async fn harvest_handler(State(state): State<AppState>, Json(req): Json<AdminRequest>) -> ApiResult<HarvestReport> {
    let report = call(&state, |v| v.harvest_all(&req.caller))?;
    state.metrics.strategy_failures_total.inc_by(report.failures.len() as u64);
    Ok(report)
}

async fn pause_handler(State(state): State<AppState>, Json(req): Json<AdminRequest>) -> ApiResult<()> {
    call(&state, |v| v.pause(&req.caller))
}

async fn unpause_handler(State(state): State<AppState>, Json(req): Json<AdminRequest>) -> ApiResult<()> {
    call(&state, |v| v.unpause(&req.caller))
}

/// `POST /admin/shutdown`. Returns the state the vault left.
async fn shutdown_handler(
    State(state): State<AppState>,
    Json(req): Json<AdminRequest>,
) -> ApiResult<EmergencyState> {
    call(&state, |v| v.activate_shutdown(&req.caller))
}

// ---------------------------------------------------------------------------
// Bridge handlers
// ---------------------------------------------------------------------------

async fn bridge_deposit_handler(
    State(state): State<AppState>,
    Json(req): Json<BridgeDepositRequest>,
) -> impl IntoResponse {
    let receiver = req.receiver.unwrap_or_else(|| req.sender.clone());
    call(&state, |v| v.dispatch_deposit(&req.sender, req.assets, req.destination, &receiver))
}

async fn bridge_withdraw_handler(
    State(state): State<AppState>,
    Json(req): Json<BridgeWithdrawRequest>,
) -> impl IntoResponse {
    let owner = req.owner.unwrap_or_else(|| req.caller.clone());
    let receiver = req.receiver.unwrap_or_else(|| owner.clone());
    call(&state, |v| {
        v.dispatch_withdraw(&req.caller, &owner, req.shares, req.destination, &receiver)
    })
}

async fn inbound_handler(State(state): State<AppState>, Json(req): Json<InboundRequest>) -> impl IntoResponse {
    call(&state, |v| v.receive(&req.relayer, req.message))
}

async fn confirm_handler(State(state): State<AppState>, Json(req): Json<NonceRequest>) -> ApiResult<()> {
    call(&state, |v| v.confirm_delivery(&req.relayer, req.nonce))
}

async fn retry_handler(State(state): State<AppState>, Json(req): Json<NonceRequest>) -> impl IntoResponse {
    call(&state, |v| v.retry(&req.relayer, req.nonce))
}

/// `GET /bridge/outbox`. Hands every accepted outbound envelope to the
/// caller, who is expected to relay it.
async fn outbox_handler(State(state): State<AppState>) -> Json<Vec<CrossChainMessage>> {
    Json(state.transport.drain())
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// `GET /ws`. Pushes every vault event as JSON; client messages are ignored.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(record) => {
                        let payload = match serde_json::to_string(&record) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to serialize ws event");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "ws subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use meridian_engine::access::Role;
    use meridian_engine::config::VaultConfig;
    use meridian_engine::crosschain::MessageKind;
    use meridian_engine::events::VaultEvent;
    use meridian_engine::types::ManualClock;
    use meridian_engine::VaultBuilder;
    use meridian_sim::{SimulatedStrategy, StrategyProfile};
    use tower::ServiceExt;

    use crate::metrics::NodeMetrics;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    /// A fee-free vault on chain 1 with one strategy, a relayer, and
    /// chain 10 trusted.
    fn test_app_state() -> AppState {
        let mut config = VaultConfig::new(AssetId::new("USDC"), ChainId(1));
        config.management_fee_bps = 0;
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let transport = Arc::new(LoopbackTransport::new(ChainId(1)));
        let admin = addr("admin");
        let vault = VaultBuilder::new(config, admin.clone())
            .clock(clock.clone())
            .transport(transport.clone())
            .build()
            .unwrap();
        let strategy = SimulatedStrategy::new(AssetId::new("USDC"), StrategyProfile::new("lend", 0), clock);
        vault.add_strategy(&admin, Arc::new(strategy), 5_000, 50).unwrap();
        vault.grant_role(&admin, &addr("relayer"), Role::Relayer).unwrap();
        vault.trust_chain(&admin, ChainId(10), addr("vault-10")).unwrap();
        vault.drain_events().unwrap();

        let (event_tx, _) = broadcast::channel(64);
        AppState {
            version: "0.1.0-test".into(),
            vault: Arc::new(vault),
            transport,
            event_tx,
            metrics: Arc::new(NodeMetrics::new().unwrap()),
        }
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn post_json(router: &Router, path: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    fn error_kind(body: &[u8]) -> Option<ErrorKind> {
        serde_json::from_slice::<ErrorResponse>(body).unwrap().kind
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_app_state());
        let (status, body) = get(&router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn deposit_then_read_back() {
        let state = test_app_state();
        let router = create_router(state.clone());

        let (status, body) = post_json(&router, "/deposit", serde_json::json!({ "caller": "alice", "assets": 5_000 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<u64>(&body).unwrap(), 5_000);

        let (status, body) = get(&router, "/balances/alice").await;
        assert_eq!(status, StatusCode::OK);
        let balance: BalanceResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!((balance.shares, balance.assets, balance.max_redeem), (5_000, 5_000, 5_000));

        let (_, body) = get(&router, "/status").await;
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.total_assets, 5_000);
        assert_eq!(status.emergency, EmergencyState::Normal);

        assert_eq!(state.metrics.deposits_total.get(), 1);
        assert_eq!(state.metrics.total_assets.get(), 5_000);
    }

    #[tokio::test]
    async fn deposit_for_another_receiver() {
        let router = create_router(test_app_state());
        let body = serde_json::json!({ "caller": "alice", "assets": 700, "receiver": "bob" });
        let (status, _) = post_json(&router, "/deposit", body).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = get(&router, "/balances/bob").await;
        let balance: BalanceResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(balance.shares, 700);
    }

    #[tokio::test]
    async fn error_kinds_map_to_status_codes() {
        let router = create_router(test_app_state());

        let (status, body) = post_json(&router, "/deposit", serde_json::json!({ "caller": "alice", "assets": 0 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(&body), Some(ErrorKind::Validation));

        let (status, body) = post_json(&router, "/admin/rebalance", serde_json::json!({ "caller": "mallory" })).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_kind(&body), Some(ErrorKind::Unauthorized));

        let (status, body) = post_json(&router, "/redeem", serde_json::json!({ "caller": "alice", "shares": 10 })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error_kind(&body), Some(ErrorKind::InsufficientFunds));

        let (status, _) = post_json(&router, "/admin/pause", serde_json::json!({ "caller": "admin" })).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = post_json(&router, "/deposit", serde_json::json!({ "caller": "alice", "assets": 10 })).await;
        assert_eq!(status, StatusCode::LOCKED);
        assert_eq!(error_kind(&body), Some(ErrorKind::InvalidState));
    }

    #[test]
    fn every_kind_has_a_status() {
        assert_eq!(status_for(ErrorKind::Capacity), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::SlippageExceeded), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::StrategyFailure), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::Storage), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn admin_rebalance_and_shutdown() {
        let router = create_router(test_app_state());
        post_json(&router, "/deposit", serde_json::json!({ "caller": "alice", "assets": 4_000 })).await;

        // The deposit already deployed a quarter of idle cash; the
        // rebalance tops the slot up to its 50% target.
        let (status, body) = post_json(&router, "/admin/rebalance", serde_json::json!({ "caller": "admin" })).await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["deposited"], 1_000);

        let (_, body) = get(&router, "/strategies").await;
        let slots: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(slots[0]["current_assets"], 2_000);

        let (status, body) = post_json(&router, "/admin/shutdown", serde_json::json!({ "caller": "admin" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<EmergencyState>(&body).unwrap(), EmergencyState::Normal);

        let body = serde_json::json!({ "owner": "alice", "shares": 4_000 });
        let (status, body) = post_json(&router, "/emergency-withdraw", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<u64>(&body).unwrap(), 4_000);
    }

    #[tokio::test]
    async fn redelivered_inbound_is_a_duplicate() {
        let state = test_app_state();
        let router = create_router(state.clone());
        let bob = addr("bob");
        let message = CrossChainMessage::new(
            MessageKind::Deposit,
            bob.clone(),
            bob,
            900,
            ChainId(10),
            ChainId(1),
            addr("vault-10"),
            1_700_000_000,
        );
        let body = serde_json::json!({ "relayer": "relayer", "message": message });

        let (status, first) = post_json(&router, "/bridge/inbound", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let first: serde_json::Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(first["outcome"], "applied");

        let (_, second) = post_json(&router, "/bridge/inbound", body).await;
        let second: serde_json::Value = serde_json::from_slice(&second).unwrap();
        assert_eq!(second["outcome"], "duplicate");

        let (_, balance) = get(&router, "/balances/bob").await;
        assert_eq!(serde_json::from_slice::<BalanceResponse>(&balance).unwrap().shares, 900);
        assert_eq!(state.metrics.crosschain_applied_total.get(), 1);
        assert_eq!(state.metrics.crosschain_duplicates.get(), 1);

        let (status, body) = get(&router, &format!("/messages/{}", message.nonce.to_hex())).await;
        assert_eq!(status, StatusCode::OK);
        let lookup: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(lookup["direction"], "inbound");
    }

    #[tokio::test]
    async fn unknown_and_malformed_nonces() {
        let router = create_router(test_app_state());
        let (status, _) = get(&router, &format!("/messages/{}", "ab".repeat(32))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = get(&router, "/messages/not-hex").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(&body), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn outbound_deposit_reaches_the_outbox() {
        let router = create_router(test_app_state());
        let body = serde_json::json!({ "sender": "alice", "assets": 250, "destination": 10 });
        let (status, body) = post_json(&router, "/bridge/deposit", body).await;
        assert_eq!(status, StatusCode::OK);
        let receipt: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let nonce = receipt["nonce"].as_str().unwrap().to_string();

        let (_, body) = get(&router, "/bridge/outbox").await;
        let outbox: Vec<CrossChainMessage> = serde_json::from_slice(&body).unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].amount, 250);

        let body = serde_json::json!({ "relayer": "relayer", "nonce": nonce });
        let (status, _) = post_json(&router, "/bridge/confirm", body).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn outbound_withdraw_for_someone_else_is_forbidden() {
        let router = create_router(test_app_state());
        let body = serde_json::json!({
            "caller": "mallory",
            "owner": "alice",
            "receiver": "mallory",
            "shares": 500,
            "destination": 10,
        });
        let (status, body) = post_json(&router, "/bridge/withdraw", body).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_kind(&body), Some(ErrorKind::Unauthorized));

        let (_, body) = get(&router, "/bridge/outbox").await;
        let outbox: Vec<CrossChainMessage> = serde_json::from_slice(&body).unwrap();
        assert!(outbox.is_empty());

        let body = serde_json::json!({ "caller": "alice", "shares": 500, "destination": 10 });
        let (status, _) = post_json(&router, "/bridge/withdraw", body).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let state = test_app_state();
        let mut rx = state.event_tx.subscribe();
        let router = create_router(state);

        post_json(&router, "/deposit", serde_json::json!({ "caller": "carol", "assets": 42 })).await;
        let mut seen = Vec::new();
        while let Ok(record) = rx.try_recv() {
            seen.push(record.event);
        }
        assert!(seen.iter().any(|e| matches!(e, VaultEvent::Deposit { assets: 42, .. })));
    }
}
