//! HTTP API for health checks, failover state, lock inspection and gas quotes

use crate::chain::RpcStateSnapshot;
use crate::config::{ApiConfig, ChainConfig};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::registry::CoordinatorRegistry;
use crate::state::{WalletKey, WalletLock};
use crate::tx::{GasConfig, GasStrategy, TriggerType};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Gas used by a plain value transfer, the basis for quotes
const TRANSFER_GAS: u64 = 21_000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CoordinatorRegistry>,
    pub gas: Arc<GasStrategy>,
    pub chains: Arc<Vec<ChainConfig>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        registry: Arc<CoordinatorRegistry>,
        gas: Arc<GasStrategy>,
        chains: Vec<ChainConfig>,
    ) -> Self {
        Self {
            registry,
            gas,
            chains: Arc::new(chains),
            started_at: Instant::now(),
        }
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/rpc", get(get_rpc_state))
        .route("/locks/:wallet/:chain_id", get(get_lock))
        .route("/gas/:chain_id", get(get_gas_quote))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> CoordinatorResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordinatorError::Config(format!("Cannot bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("API server failed: {}", e)))
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Readiness check - the store must answer; endpoints on fallback are reported
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.registry.store().health_check().await.is_ok();
    let endpoints_on_fallback = state
        .registry
        .providers()
        .snapshots()
        .into_iter()
        .filter(|s| s.using_fallback)
        .map(|s| s.primary_url)
        .collect();

    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: database,
            database,
            endpoints_on_fallback,
        }),
    )
}

/// Failover state of every cached endpoint pair
async fn get_rpc_state(State(state): State<AppState>) -> Json<Vec<RpcStateSnapshot>> {
    Json(state.registry.providers().snapshots())
}

/// Current lock row for a (wallet, chain)
async fn get_lock(
    State(state): State<AppState>,
    Path((wallet, chain_id)): Path<(String, u64)>,
) -> impl IntoResponse {
    let key = match WalletKey::new(&wallet, chain_id) {
        Ok(key) => key,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(LockResponse::error(e.to_string())),
            )
        }
    };

    match state.registry.store().get_lock(&key).await {
        Ok(Some(lock)) => (StatusCode::OK, Json(LockResponse::found(lock))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(LockResponse::error(format!("No lock recorded for {}", key))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(LockResponse::error(e.to_string())),
        ),
    }
}

#[derive(Deserialize)]
struct GasQuoteParams {
    trigger: Option<String>,
}

/// Current pricing for a plain transfer on a configured chain
async fn get_gas_quote(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
    Query(params): Query<GasQuoteParams>,
) -> Result<Json<GasConfig>, (StatusCode, Json<ErrorResponse>)> {
    let trigger = match params.trigger.as_deref() {
        Some(trigger) => trigger
            .parse::<TriggerType>()
            .map_err(|e| ErrorResponse::reply(StatusCode::BAD_REQUEST, e))?,
        None => TriggerType::Manual,
    };

    let chain = state
        .chains
        .iter()
        .find(|c| c.enabled && c.chain_id == chain_id)
        .ok_or_else(|| {
            ErrorResponse::reply(
                StatusCode::NOT_FOUND,
                format!("Chain {} is not configured", chain_id),
            )
        })?;

    let provider = state
        .registry
        .providers()
        .get_or_connect(&chain.rpc_url, chain.fallback_rpc_url.as_deref())
        .map_err(|e| ErrorResponse::reply(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    state
        .gas
        .get_gas_config(
            provider.as_ref(),
            trigger,
            U256::from(TRANSFER_GAS),
            chain_id,
            None,
            None,
        )
        .await
        .map(Json)
        .map_err(|e| ErrorResponse::reply(StatusCode::BAD_GATEWAY, e))
}

// Response types

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl ErrorResponse {
    fn reply(status: StatusCode, error: impl ToString) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                error: error.to_string(),
            }),
        )
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    endpoints_on_fallback: Vec<String>,
}

#[derive(Serialize)]
struct LockResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    lock: Option<WalletLock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    held: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl LockResponse {
    fn found(lock: WalletLock) -> Self {
        Self {
            held: Some(lock.is_held()),
            lock: Some(lock),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            lock: None,
            held: None,
            error: Some(message),
        }
    }
}
