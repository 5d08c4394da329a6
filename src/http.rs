//! HTTP surface of the ledger. JSON in, JSON out.
//!
//! ## Routes
//!
//! - `POST /allocate-tool`, `POST /allocate-supply`: check items out for a labor.
//! - `POST /return-tool`, `POST /return-supply`: bring items back against a movement.
//! - `GET /outstanding-for-labor/:labor_id`: what a labor still holds, per item.
//! - `POST /catalog/tools`, `POST /catalog/supplies`, `POST /labors`: sync upserts.
//! - `GET /tools/:id`, `GET /supplies/:id`: pool counters and state.
//! - `GET /movements`, `GET /movements/tools/:id`, `GET /movements/supplies/:id`,
//!   `GET /movements/summary`: movement history.
//! - `GET /audit`, `GET /health`.
//!
//! Mutating routes honour an `x-request-timeout-ms` header; without it the
//! configured default deadline applies.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::Instant;
use ulid::Ulid;

use crate::engine::{
    ConservationBreach, Engine, EngineError, ReturnRequest, SupplyAllocation, SupplySpec,
    ToolAllocation, ToolSpec,
};
use crate::model::*;
use crate::observability::{REQUEST_DURATION_SECONDS, REQUESTS_TOTAL, status_label};

pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

pub struct AppState {
    pub engine: Arc<Engine>,
    pub default_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, default_timeout: Option<Duration>) -> Self {
        Self {
            engine,
            default_timeout,
        }
    }

    /// Deadline for one request: the header wins, then the configured default.
    fn deadline(&self, headers: &HeaderMap) -> Option<Instant> {
        let from_header = headers
            .get(TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_millis);
        from_header
            .or(self.default_timeout)
            .map(|t| Instant::now() + t)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/allocate-tool", post(allocate_tool))
        .route("/allocate-supply", post(allocate_supply))
        .route("/return-tool", post(return_tool))
        .route("/return-supply", post(return_supply))
        .route("/outstanding-for-labor/:labor_id", get(outstanding_for_labor))
        .route("/catalog/tools", post(sync_tool))
        .route("/catalog/supplies", post(sync_supply))
        .route("/labors", post(sync_labor))
        .route("/tools/:id", get(get_tool))
        .route("/supplies/:id", get(get_supply))
        .route("/movements", get(list_movements))
        .route("/movements/summary", get(movement_summary))
        .route("/movements/tools/:id", get(tool_movement))
        .route("/movements/supplies/:id", get(supply_movement))
        .route("/audit", get(audit))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then let in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// ── Errors ───────────────────────────────────────────────────────

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

pub fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::NotFound(..) => StatusCode::NOT_FOUND,
        EngineError::InvalidState { .. } | EngineError::InsufficientStock { .. } => {
            StatusCode::CONFLICT
        }
        EngineError::ProgramMismatch { .. } | EngineError::ExcessReturn { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::InvalidQuantity(_) | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
        EngineError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(e: &EngineError) -> Value {
    let mut body = json!({ "error": e.code(), "message": e.to_string() });
    let details = match e {
        EngineError::NotFound(entity, id) => json!({ "entity": entity.as_str(), "id": id }),
        EngineError::InvalidState { entity, id, state } => {
            json!({ "entity": entity.as_str(), "id": id, "state": state })
        }
        EngineError::InsufficientStock {
            item_id,
            requested,
            available,
        } => json!({ "item_id": item_id, "requested": requested, "available": available }),
        EngineError::ProgramMismatch {
            supply_program,
            labor_program,
        } => json!({ "supply_program": supply_program, "labor_program": labor_program }),
        EngineError::ExcessReturn {
            movement_id,
            requested,
            outstanding,
        } => json!({
            "movement_id": movement_id,
            "requested": requested,
            "outstanding": outstanding,
        }),
        _ => return body,
    };
    if let (Some(obj), Value::Object(extra)) = (body.as_object_mut(), details) {
        obj.extend(extra);
    }
    body
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self.0, EngineError::WalError(_)) {
            tracing::error!("request failed: {}", self.0);
        }
        let mut resp = (status_for(&self.0), Json(error_body(&self.0))).into_response();
        if self.0.is_retryable() {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        resp
    }
}

fn observe<T>(operation: &'static str, started: std::time::Instant, result: &Result<T, EngineError>) {
    metrics::counter!(REQUESTS_TOTAL, "operation" => operation, "status" => status_label(result))
        .increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

// ── Movements ────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Allocated<Q> {
    pub movement_id: Ulid,
    pub outstanding: Q,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Returned<Q> {
    pub outstanding_remaining: Q,
}

async fn allocate_tool(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ToolAllocation>,
) -> Result<Json<Allocated<u32>>, ApiError> {
    let started = std::time::Instant::now();
    let result = app.engine.allocate_tool(req, app.deadline(&headers)).await;
    observe("allocate_tool", started, &result);
    let m = result?;
    Ok(Json(Allocated {
        movement_id: m.id,
        outstanding: m.outstanding(),
    }))
}

async fn allocate_supply(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SupplyAllocation>,
) -> Result<Json<Allocated<Decimal>>, ApiError> {
    let started = std::time::Instant::now();
    let result = app.engine.allocate_supply(req, app.deadline(&headers)).await;
    observe("allocate_supply", started, &result);
    let m = result?;
    Ok(Json(Allocated {
        movement_id: m.id,
        outstanding: m.outstanding(),
    }))
}

async fn return_tool(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReturnRequest<u32>>,
) -> Result<Json<Returned<u32>>, ApiError> {
    let started = std::time::Instant::now();
    let result = app.engine.return_tool(req, app.deadline(&headers)).await;
    observe("return_tool", started, &result);
    Ok(Json(Returned {
        outstanding_remaining: result?.outstanding(),
    }))
}

async fn return_supply(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReturnRequest<Decimal>>,
) -> Result<Json<Returned<Decimal>>, ApiError> {
    let started = std::time::Instant::now();
    let result = app.engine.return_supply(req, app.deadline(&headers)).await;
    observe("return_supply", started, &result);
    Ok(Json(Returned {
        outstanding_remaining: result?.outstanding(),
    }))
}

async fn outstanding_for_labor(
    State(app): State<Arc<AppState>>,
    Path(labor_id): Path<Ulid>,
) -> Json<Vec<OutstandingItem>> {
    let started = std::time::Instant::now();
    let view = app.engine.outstanding_for_labor(labor_id).await;
    observe::<()>("outstanding_for_labor", started, &Ok(()));
    Json(view)
}

// ── Catalog sync ─────────────────────────────────────────────────

async fn sync_tool(
    State(app): State<Arc<AppState>>,
    Json(spec): Json<ToolSpec>,
) -> Result<Json<ToolInfo>, ApiError> {
    let started = std::time::Instant::now();
    let result = app.engine.sync_tool(spec).await;
    observe("sync_tool", started, &result);
    Ok(Json(result?))
}

async fn sync_supply(
    State(app): State<Arc<AppState>>,
    Json(spec): Json<SupplySpec>,
) -> Result<Json<SupplyInfo>, ApiError> {
    let started = std::time::Instant::now();
    let result = app.engine.sync_supply(spec).await;
    observe("sync_supply", started, &result);
    Ok(Json(result?))
}

async fn sync_labor(
    State(app): State<Arc<AppState>>,
    Json(facts): Json<LaborFacts>,
) -> Result<Json<LaborFacts>, ApiError> {
    let started = std::time::Instant::now();
    let result = app.engine.sync_labor(facts).await;
    observe("sync_labor", started, &result);
    Ok(Json(result?))
}

// ── Reads ────────────────────────────────────────────────────────

async fn get_tool(
    State(app): State<Arc<AppState>>,
    Path(id): Path<Ulid>,
) -> Result<Json<ToolInfo>, ApiError> {
    Ok(Json(app.engine.get_tool(id).await?))
}

async fn get_supply(
    State(app): State<Arc<AppState>>,
    Path(id): Path<Ulid>,
) -> Result<Json<SupplyInfo>, ApiError> {
    Ok(Json(app.engine.get_supply(id).await?))
}

async fn list_movements(
    State(app): State<Arc<AppState>>,
    Query(filter): Query<MovementFilter>,
) -> Json<Vec<MovementInfo>> {
    Json(app.engine.list_movements(&filter).await)
}

async fn tool_movement(
    State(app): State<Arc<AppState>>,
    Path(id): Path<Ulid>,
) -> Result<Json<MovementInfo>, ApiError> {
    Ok(Json(app.engine.tool_movement(id).await?))
}

async fn supply_movement(
    State(app): State<Arc<AppState>>,
    Path(id): Path<Ulid>,
) -> Result<Json<MovementInfo>, ApiError> {
    Ok(Json(app.engine.supply_movement(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct SummaryParams {
    #[serde(default)]
    since: Ms,
}

async fn movement_summary(
    State(app): State<Arc<AppState>>,
    Query(params): Query<SummaryParams>,
) -> Json<MovementSummary> {
    Json(app.engine.movement_summary(params.since).await)
}

#[derive(Debug, Serialize)]
struct AuditReport {
    ok: bool,
    breaches: Vec<ConservationBreach>,
}

async fn audit(State(app): State<Arc<AppState>>) -> Json<AuditReport> {
    let breaches = app.engine.verify_conservation().await;
    if !breaches.is_empty() {
        tracing::warn!("conservation audit found {} unbalanced items", breaches.len());
    }
    Json(AuditReport {
        ok: breaches.is_empty(),
        breaches,
    })
}

async fn health(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let store = app.engine.store();
    Json(json!({
        "ok": true,
        "tools": store.tool_count(),
        "supplies": store.supply_count(),
        "labors": store.labors().len(),
    }))
}
