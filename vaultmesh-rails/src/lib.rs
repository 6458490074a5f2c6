//! vaultmesh-rails
//!
//! Axum-based HTTP service running a complete rebalancing mesh in one
//! process: the home-chain controller and one vault per registered chain, each
//! on its own tokio task, talking through an in-process bridge that can be
//! configured to drop and duplicate messages.

pub mod actors;
pub mod bridge;
pub mod config;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    async_trait,
    extract::{FromRequestParts, Json, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use vaultmesh_core::{
    ChainVault, OrchestratorError, PolicyGuard, Principal, RebalanceController, StrategyAdapter,
    VaultEndpoint,
};
use vaultmesh_gmp::{chains, ChainId};

use crate::actors::{
    spawn_controller, spawn_vault, unix_now, ActorStopped, ControllerHandle, TrustedController,
    VaultHandle,
};
use crate::bridge::{Endpoint, Faults, LocalBridge};
use crate::config::RailsConfig;

pub const SERVICE_NAME: &str = "vaultmesh";

/// Header carrying the caller's principal
pub const PRINCIPAL_HEADER: &str = "x-principal";

/// Bridge sender identity of the controller endpoint
const CONTROLLER_SENDER: &str = "controller";

// ═══════════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RailsConfig>,
    /// Handle to the controller actor
    pub controller: ControllerHandle,
    /// Vault actors by chain
    pub vaults: Arc<RwLock<BTreeMap<ChainId, VaultHandle>>>,
    pub bridge: LocalBridge,
}

/// Principal a chain's vault reports under
pub fn vault_principal(chain_id: ChainId) -> Principal {
    Principal::new(format!("vault:{}", chain_id))
}

/// Strategy set every vault starts with
fn default_vault(chain_id: ChainId) -> ChainVault {
    ChainVault::new(chain_id)
        .with_strategy(StrategyAdapter::reserve(0), 1)
        .with_strategy(StrategyAdapter::lending("lending", 0, 0), 2)
        .with_strategy(StrategyAdapter::staking("staking", 0, u64::MAX), 1)
}

impl AppState {
    /// Build the mesh and spawn every actor. Must run inside a tokio runtime.
    pub fn spawn(config: RailsConfig) -> anyhow::Result<Self> {
        let bridge = LocalBridge::new(Faults {
            drop_rate: config.drop_rate,
            duplicate_rate: config.duplicate_rate,
        });
        let controller_inbox = bridge.attach(config.home_chain, Endpoint::Controller);

        let mut guard = PolicyGuard::new(config.dao.clone(), config.guardian.clone());
        if let Some(scheduler) = &config.scheduler {
            guard = guard.with_scheduler(scheduler.clone());
        }
        let mut controller = RebalanceController::new(
            config.orchestrator(),
            guard,
            config.weights.clone(),
            bridge.handle(config.home_chain, CONTROLLER_SENDER),
        );

        let now = unix_now();
        let mut vaults = BTreeMap::new();
        for chain_id in &config.chains {
            controller
                .register_chain(&config.dao, *chain_id, endpoint_for(*chain_id), now)
                .with_context(|| format!("failed to register chain {}", chain_id))?;
            vaults.insert(*chain_id, start_vault(&bridge, &config, *chain_id));
        }

        let (controller, _task) = spawn_controller(
            controller,
            controller_inbox,
            Duration::from_millis(config.tick_millis.max(1)),
        );

        info!(
            home_chain = config.home_chain,
            chains = ?config.chains,
            drop_rate = config.drop_rate,
            duplicate_rate = config.duplicate_rate,
            "mesh started"
        );

        Ok(Self {
            config: Arc::new(config),
            controller,
            vaults: Arc::new(RwLock::new(vaults)),
            bridge,
        })
    }

    async fn vault(&self, chain_id: ChainId) -> Result<VaultHandle, ApiError> {
        self.vaults
            .read()
            .await
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("no vault on chain {}", chain_id)))
    }
}

fn endpoint_for(chain_id: ChainId) -> VaultEndpoint {
    VaultEndpoint::new(format!("0x{:040x}", chain_id), vault_principal(chain_id))
}

fn start_vault(bridge: &LocalBridge, config: &RailsConfig, chain_id: ChainId) -> VaultHandle {
    let inbox = bridge.attach(chain_id, Endpoint::Vault);
    let (handle, _task) = spawn_vault(
        default_vault(chain_id),
        inbox,
        bridge.handle(chain_id, vault_principal(chain_id).to_string()),
        TrustedController {
            chain_id: config.home_chain,
            sender: CONTROLLER_SENDER.to_string(),
        },
        Duration::from_millis(config.move_delay_millis),
        Duration::from_millis(config.transfer_timeout_millis),
    );
    handle
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Build the router
pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & info
        .route("/health", get(health))
        .route("/info", get(info))
        // Chain registry
        .route("/chains", get(list_chains))
        .route("/chains/supported", get(list_supported_chains))
        .route("/chains/register", post(register_chain))
        // Rounds
        .route("/rounds/start", post(start_round))
        .route("/rounds/dispatch", post(dispatch_round))
        .route("/rounds/force-advance", post(force_advance))
        .route("/rounds/force-settle", post(force_settle))
        .route("/rounds/current", get(current_round))
        .route("/rounds/history", get(round_history))
        .route("/audit", get(audit_log))
        // Roles & emergency
        .route("/roles/dao", post(set_dao))
        .route("/roles/guardian", post(set_guardian))
        .route("/roles/scheduler", post(set_scheduler))
        .route("/pause", post(pause))
        .route("/unpause", post(unpause))
        // Vaults & bridge
        .route("/vaults/:chain_id", get(get_vault))
        .route("/vaults/:chain_id/credit", post(credit_vault))
        .route("/bridge/stats", get(bridge_stats))
        .layer(cors)
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct RegisterChainRequest {
    /// Chain id or known chain name
    pub chain: String,
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub principal: String,
}

#[derive(Debug, Deserialize)]
pub struct SchedulerRequest {
    pub principal: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    pub amount: u64,
}

#[derive(Debug, Deserialize)]
pub struct SupportedChainsQuery {
    /// Only chains marked production-ready
    pub production: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

/// Caller identity taken from the `x-principal` header
pub struct Caller(pub Principal);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(PRINCIPAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError {
                status: StatusCode::UNAUTHORIZED,
                message: format!("missing {} header", PRINCIPAL_HEADER),
                code: "MISSING_PRINCIPAL".to_string(),
            })?;
        Ok(Caller(Principal::new(value)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ═══════════════════════════════════════════════════════════════════════════════

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn info(State(state): State<AppState>, caller: Option<Caller>) -> ApiResult {
    let config = state.config.clone();
    let body = state
        .controller
        .call(move |controller, _| {
            let caller_roles = caller.map(|Caller(caller)| controller.guard().roles_of(&caller));
            json!({
                "caller_roles": caller_roles,
                "service": SERVICE_NAME,
                "home_chain": config.home_chain,
                "state": controller.state(),
                "round_id": controller.round_id(),
                "paused": controller.is_paused(),
                "roles": controller.guard().bindings(),
                "weights": controller.weights(),
                "report_window_secs": controller.config().report_window_secs,
                "ack_window_secs": controller.config().ack_window_secs,
                "remainder_chain": controller.config().remainder_chain(),
                "fault_injection": {
                    "drop_rate": config.drop_rate,
                    "duplicate_rate": config.duplicate_rate,
                },
            })
        })
        .await?;
    Ok(Json(body))
}

async fn list_chains(State(state): State<AppState>) -> ApiResult {
    let chains = state
        .controller
        .call(|controller, _| {
            let entries: Vec<_> = controller
                .chains()
                .map(|entry| {
                    json!({
                        "entry": entry,
                        "reconciliation": controller.reconciliation(entry.chain_id).to_string(),
                    })
                })
                .collect();
            entries
        })
        .await?;
    Ok(Json(json!({ "chains": chains })))
}

async fn list_supported_chains(Query(query): Query<SupportedChainsQuery>) -> impl IntoResponse {
    let chains = if query.production.unwrap_or(false) {
        chains::production_chains()
    } else {
        chains::known_chains().iter().collect()
    };
    Json(json!({ "chains": chains }))
}

async fn register_chain(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<RegisterChainRequest>,
) -> ApiResult {
    let chain_id = chains::resolve(&request.chain).ok_or_else(|| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: format!("unknown chain {:?}", request.chain),
        code: "UNKNOWN_CHAIN_NAME".to_string(),
    })?;

    state
        .controller
        .call(move |controller, now| {
            controller.register_chain(&caller, chain_id, endpoint_for(chain_id), now)
        })
        .await??;

    let mut vaults = state.vaults.write().await;
    if !vaults.contains_key(&chain_id) {
        vaults.insert(chain_id, start_vault(&state.bridge, &state.config, chain_id));
    }

    Ok(Json(json!({
        "chain_id": chain_id,
        "chain_name": chains::display_name(chain_id),
        "vault_principal": vault_principal(chain_id),
    })))
}

async fn start_round(State(state): State<AppState>, Caller(caller): Caller) -> ApiResult {
    let round_id = state
        .controller
        .call(move |controller, now| controller.start_round(&caller, now))
        .await??;
    Ok(Json(json!({ "round_id": round_id, "state": "awaiting_reports" })))
}

async fn dispatch_round(State(state): State<AppState>, Caller(caller): Caller) -> ApiResult {
    let (round_id, instructions) = state
        .controller
        .call(move |controller, now| {
            let round_id = controller.round_id();
            controller
                .compute_and_dispatch(&caller, now)
                .map(|instructions| (round_id, instructions))
        })
        .await??;
    Ok(Json(json!({ "round_id": round_id, "instructions": instructions })))
}

async fn force_advance(State(state): State<AppState>, Caller(caller): Caller) -> ApiResult {
    let failed = state
        .controller
        .call(move |controller, now| controller.force_advance(&caller, now))
        .await??;
    Ok(Json(json!({ "failed_chains": failed })))
}

async fn force_settle(State(state): State<AppState>, Caller(caller): Caller) -> ApiResult {
    let summary = state
        .controller
        .call(move |controller, now| controller.force_settle(&caller, now))
        .await??;
    Ok(Json(json!(summary)))
}

async fn current_round(State(state): State<AppState>) -> ApiResult {
    let body = state
        .controller
        .call(|controller, _| {
            json!({
                "state": controller.state(),
                "round_id": controller.round_id(),
                "paused": controller.is_paused(),
                "round": controller.round(),
            })
        })
        .await?;
    Ok(Json(body))
}

async fn round_history(State(state): State<AppState>) -> ApiResult {
    let history = state
        .controller
        .call(|controller, _| controller.history().cloned().collect::<Vec<_>>())
        .await?;
    Ok(Json(json!({ "rounds": history })))
}

async fn audit_log(State(state): State<AppState>, Query(query): Query<AuditQuery>) -> ApiResult {
    let limit = query.limit.unwrap_or(100);
    let events = state
        .controller
        .call(move |controller, _| controller.journal().recent(limit))
        .await?;
    Ok(Json(json!({ "events": events })))
}

async fn set_dao(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<RoleRequest>,
) -> ApiResult {
    let dao = Principal::new(&request.principal);
    state
        .controller
        .call(move |controller, now| controller.set_dao(&caller, dao, now))
        .await??;
    Ok(Json(json!({ "dao": Principal::new(&request.principal) })))
}

async fn set_guardian(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<RoleRequest>,
) -> ApiResult {
    let guardian = Principal::new(&request.principal);
    state
        .controller
        .call(move |controller, now| controller.set_guardian(&caller, guardian, now))
        .await??;
    Ok(Json(json!({ "guardian": Principal::new(&request.principal) })))
}

async fn set_scheduler(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<SchedulerRequest>,
) -> ApiResult {
    let scheduler = request.principal.as_deref().map(Principal::new);
    let echo = scheduler.clone();
    state
        .controller
        .call(move |controller, now| controller.set_scheduler(&caller, scheduler, now))
        .await??;
    Ok(Json(json!({ "scheduler": echo })))
}

async fn pause(State(state): State<AppState>, Caller(caller): Caller) -> ApiResult {
    state
        .controller
        .call(move |controller, now| controller.pause(&caller, now))
        .await??;
    Ok(Json(json!({ "paused": true })))
}

async fn unpause(State(state): State<AppState>, Caller(caller): Caller) -> ApiResult {
    state
        .controller
        .call(move |controller, now| controller.unpause(&caller, now))
        .await??;
    Ok(Json(json!({ "paused": false })))
}

async fn get_vault(State(state): State<AppState>, Path(chain_id): Path<ChainId>) -> ApiResult {
    let vault = state.vault(chain_id).await?;
    let snapshot = vault.call(|vault| vault.snapshot()).await?;
    Ok(Json(json!(snapshot)))
}

/// Simulates bridged funds landing on a chain. Dao only.
async fn credit_vault(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(chain_id): Path<ChainId>,
    Json(request): Json<CreditRequest>,
) -> ApiResult {
    state
        .controller
        .call(move |controller, _| controller.guard().require_dao(&caller))
        .await??;

    let vault = state.vault(chain_id).await?;
    let snapshot = vault
        .call(move |vault| {
            vault.credit_inbound(request.amount);
            vault.snapshot()
        })
        .await?;
    Ok(Json(json!(snapshot)))
}

async fn bridge_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!(state.bridge.stats()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
            code: "NOT_FOUND".to_string(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let status = match &e {
            OrchestratorError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            OrchestratorError::UnknownChain(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Malformed(_)
            | OrchestratorError::Allocation(_)
            | OrchestratorError::TotalOverflow { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::CONFLICT,
        };
        Self {
            status,
            message: e.to_string(),
            code: e.code().to_string(),
        }
    }
}

impl From<ActorStopped> for ApiError {
    fn from(e: ActorStopped) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: e.to_string(),
            code: "ACTOR_STOPPED".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({
            "error": self.message,
            "error_code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MAIN ENTRY
// ═══════════════════════════════════════════════════════════════════════════════

pub mod main_entry {
    use super::*;
    use std::net::SocketAddr;
    use tracing_subscriber::EnvFilter;

    const DEFAULT_LOG_FILTER: &str = "vaultmesh_rails=info,vaultmesh=info";

    pub async fn run_server() -> anyhow::Result<()> {
        dotenvy::dotenv().ok();

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
        if std::env::var("VAULTMESH_LOG_FORMAT").as_deref() == Ok("json") {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }

        let config = RailsConfig::from_env()?;
        let port = config.port;
        let state = AppState::spawn(config)?;

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!("vaultmesh rails listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        axum::serve(listener, app_router(state))
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await?;

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use axum_test::TestServer;

    fn server() -> TestServer {
        let state = AppState::spawn(RailsConfig::local("0xdao", "0xguardian")).unwrap();
        TestServer::new(app_router(state)).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = server().get("/health").await;
        response.assert_status_ok();

        let body: serde_json::Value = response.json();
        assert_eq!(body["service"], SERVICE_NAME);
    }

    #[tokio::test]
    async fn test_info() {
        let response = server().get("/info").await;
        response.assert_status_ok();

        let body: serde_json::Value = response.json();
        assert_eq!(body["home_chain"], 1);
        assert_eq!(body["state"], "idle");
        assert_eq!(body["roles"]["dao"], "0xdao");
    }

    #[tokio::test]
    async fn test_missing_principal_rejected() {
        let response = server().post("/rounds/start").await;
        response.assert_status(StatusCode::UNAUTHORIZED);

        let body: serde_json::Value = response.json();
        assert_eq!(body["error_code"], "MISSING_PRINCIPAL");
    }

    #[test]
    fn test_error_status_mapping() {
        let unauthorized = ApiError::from(OrchestratorError::Paused);
        assert_eq!(unauthorized.status, StatusCode::CONFLICT);
        assert_eq!(unauthorized.code, "PAUSED");

        let unknown = ApiError::from(OrchestratorError::UnknownChain(5));
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    }
}
