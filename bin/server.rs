// Entity Consolidation - API Server
// Read-only JSON API over the stored snapshot

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use clap::Parser;
use entity_consolidation::{
    get_associations_for, get_entities, get_entity, get_latest_run, get_review_queue, open_database,
    EntityType,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "consolidation-server", version, about = "Serve consolidated entities over HTTP")]
struct Args {
    /// SQLite store written by `consolidate run`
    #[arg(long, env = "CONSOLIDATION_DB")]
    db: PathBuf,

    #[arg(long, env = "CONSOLIDATION_ADDR", default_value = "0.0.0.0:3000")]
    addr: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::internal("database lock poisoned".to_string()))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }

    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %format!("{:#}", err), "request failed");
        ApiError::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(self.message),
            }),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

#[derive(Deserialize)]
struct EntityFilter {
    entity_type: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> Response {
    ApiResponse::ok("OK")
}

/// GET /api/entities?entity_type= - Canonical entities, optionally of one type
async fn list_entities(State(state): State<AppState>, Query(filter): Query<EntityFilter>) -> ApiResult {
    let entity_type = match filter.entity_type.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            EntityType::parse(raw).ok_or_else(|| ApiError::bad_request(format!("unknown entity_type: {}", raw)))?,
        ),
    };
    let conn = state.conn()?;
    Ok(ApiResponse::ok(get_entities(&conn, entity_type)?))
}

/// GET /api/entities/:id - One canonical entity
async fn entity_by_id(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let conn = state.conn()?;
    match get_entity(&conn, &id)? {
        Some(entity) => Ok(ApiResponse::ok(entity)),
        None => Err(ApiError::not_found(format!("no entity {}", id))),
    }
}

/// GET /api/entities/:id/associations - Edges touching an entity
async fn entity_associations(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let conn = state.conn()?;
    Ok(ApiResponse::ok(get_associations_for(&conn, &id)?))
}

/// GET /api/review - Manual review queue
async fn review_queue(State(state): State<AppState>) -> ApiResult {
    let conn = state.conn()?;
    Ok(ApiResponse::ok(get_review_queue(&conn)?))
}

/// GET /api/runs/latest - Manifest of the most recent run
async fn latest_run(State(state): State<AppState>) -> ApiResult {
    let conn = state.conn()?;
    match get_latest_run(&conn)? {
        Some(run) => Ok(ApiResponse::ok(run)),
        None => Err(ApiError::not_found("no consolidation run recorded".to_string())),
    }
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/entities", get(list_entities))
        .route("/entities/:id", get(entity_by_id))
        .route("/entities/:id/associations", get(entity_associations))
        .route("/review", get(review_queue))
        .route("/runs/latest", get(latest_run))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if !args.db.exists() {
        anyhow::bail!(
            "Database not found at {}; run `consolidate run` first",
            args.db.display()
        );
    }

    let conn = open_database(&args.db)?;
    info!(db = %args.db.display(), "database opened");

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    info!(addr = %args.addr, "server listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}
