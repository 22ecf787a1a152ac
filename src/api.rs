//! HTTP API for rankings
//!
//! Read endpoints never fail on bad parameters: unknown entity types,
//! windows or sort fields fall back to defaults. Admin endpoints
//! (recompute, weights, sales) validate their input and answer 400.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::limit::ConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::ranking::cache::CacheStats;
use crate::ranking::orchestrator::{PassState, PassSummary, RecomputeOrchestrator};
use crate::ranking::service::{RankingParams, RankingQuery, RankingService, DEFAULT_TIME_WINDOW};
use crate::ranking::types::{EntityType, RankingPage, RankingRecord, ScopeKey, TimeWindow, GLOBAL_SCOPE};
use crate::ranking::weights::{WeightConfig, WeightVector};

/// Shared application state
pub struct AppState {
    pub orchestrator: RecomputeOrchestrator,
    pub service: RankingService,
}

impl AppState {
    pub fn new(orchestrator: RecomputeOrchestrator, max_page_size: usize) -> Self {
        let service = RankingService::new(orchestrator.store(), orchestrator.cache())
            .with_max_page_size(max_page_size);
        Self {
            orchestrator,
            service,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub cache: CacheStats,
    pub dirty_keys: usize,
}

/// Query params for a single entity's rank
#[derive(Debug, Default, Deserialize)]
pub struct EntityRankParams {
    pub time_window: Option<String>,
    pub category: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EntityRankResponse {
    #[serde(flatten)]
    pub record: RankingRecord,
    pub state: PassState,
}

/// Request body for a manual recompute
#[derive(Debug, Default, Deserialize)]
pub struct RecomputeRequest {
    /// Every window when absent
    pub time_window: Option<String>,
    #[serde(default)]
    pub category: i64,
}

/// Request body for a completed sale
#[derive(Debug, Deserialize)]
pub struct SaleRequest {
    pub artwork_id: i64,
    pub amount: f64,
    pub buyer_id: i64,
}

#[derive(Debug, Serialize)]
pub struct SaleResponse {
    pub dirty_keys: Vec<ScopeKey>,
}

/// Build the router with request tracing
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/rankings/:entity_type", get(get_rankings))
        .route("/api/v1/rankings/:entity_type/recompute", post(recompute))
        .route("/api/v1/rankings/:entity_type/:entity_id", get(get_entity_rank))
        .route("/api/v1/sales", post(record_sale))
        .route("/api/v1/weights", get(get_weights))
        .route("/api/v1/weights/:entity_type", put(put_weights))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the shutdown broadcast fires
pub async fn start_server(
    state: Arc<AppState>,
    config: &ApiConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let mut app = router(state).layer(
        ServiceBuilder::new()
            .layer(TimeoutLayer::new(config.request_timeout))
            .layer(ConcurrencyLimitLayer::new(config.max_concurrent_requests)),
    );
    if config.cors_enabled {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    let addr = format!("{}:{}", config.host, config.port);
    info!("🚀 Starting rankings API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| Error::Other(e.into()))?;

    info!("API server stopped");
    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache: state.orchestrator.cache().stats().await,
        dirty_keys: state.orchestrator.dirty_keys().await.len(),
    })
}

/// Ranking page; invalid parameters are replaced by defaults
async fn get_rankings(
    State(state): State<Arc<AppState>>,
    Path(entity_type): Path<String>,
    Query(params): Query<RankingParams>,
) -> Json<RankingPage> {
    let query = RankingQuery::from_params(&entity_type, &params);
    Json(state.service.get_rankings(&query).await)
}

async fn get_entity_rank(
    State(state): State<Arc<AppState>>,
    Path((entity_type, entity_id)): Path<(String, i64)>,
    Query(params): Query<EntityRankParams>,
) -> Result<Json<EntityRankResponse>> {
    let entity_type = parse_entity_type(&entity_type)?;
    let time_window = params
        .time_window
        .as_deref()
        .map(parse_time_window)
        .transpose()?
        .unwrap_or(DEFAULT_TIME_WINDOW);
    let category = params.category.unwrap_or(GLOBAL_SCOPE);

    let record = state
        .service
        .entity_rank(entity_type, entity_id, time_window, category)
        .await?
        .ok_or_else(|| Error::NotFound {
            entity_type: "ranking",
            id: format!("{}/{}", entity_type, entity_id),
        })?;
    let pass_state = state.orchestrator.state(&record.scope_key()).await;

    Ok(Json(EntityRankResponse {
        record,
        state: pass_state,
    }))
}

/// Recompute one entity type now, for one window or all of them; each
/// window reports its own outcome
async fn recompute(
    State(state): State<Arc<AppState>>,
    Path(entity_type): Path<String>,
    body: Option<Json<RecomputeRequest>>,
) -> Result<Json<PassSummary>> {
    let entity_type = parse_entity_type(&entity_type)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    if request.category < GLOBAL_SCOPE {
        return Err(Error::invalid_parameter("category", request.category.to_string()));
    }

    let windows = match request.time_window.as_deref() {
        Some(raw) => vec![parse_time_window(raw)?],
        None => TimeWindow::ALL.to_vec(),
    };

    let keys = windows
        .into_iter()
        .map(|window| ScopeKey::new(entity_type, window, request.category))
        .collect();
    Ok(Json(state.orchestrator.recompute_keys(keys).await))
}

async fn record_sale(
    State(state): State<Arc<AppState>>,
    Json(sale): Json<SaleRequest>,
) -> Result<(StatusCode, Json<SaleResponse>)> {
    let dirty_keys = state
        .orchestrator
        .on_sale_completed(sale.artwork_id, sale.amount, sale.buyer_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SaleResponse { dirty_keys })))
}

async fn get_weights(State(state): State<Arc<AppState>>) -> Json<WeightConfig> {
    Json(state.orchestrator.weights().await)
}

async fn put_weights(
    State(state): State<Arc<AppState>>,
    Path(entity_type): Path<String>,
    Json(weights): Json<WeightVector>,
) -> Result<Json<WeightConfig>> {
    let entity_type = parse_entity_type(&entity_type)?;
    state.orchestrator.set_weights(entity_type, weights).await?;
    Ok(Json(state.orchestrator.weights().await))
}

fn parse_entity_type(raw: &str) -> Result<EntityType> {
    raw.parse()
        .map_err(|_| Error::invalid_parameter("entity_type", raw))
}

fn parse_time_window(raw: &str) -> Result<TimeWindow> {
    raw.parse()
        .map_err(|_| Error::invalid_parameter("time_window", raw))
}
