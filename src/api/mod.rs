//! HTTP front door: frame ingestion, on-demand diagnosis and health.

pub mod health;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::service::{DiagnoseRequest, IngestRequest, ServiceError, TelemetryService};
use crate::store::StoreError;

use health::HealthMetrics;

/// Header naming the caller; frames are stored per user.
pub const USER_HEADER: &str = "x-user-id";
const ANONYMOUS_USER: &str = "anonymous";

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TelemetryService>,
    pub metrics: Arc<HealthMetrics>,
}

/// Builds the router serving `/ingest`, `/diagnose`, `/metrics` and `/healthz`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ingest", post(ingest_handler))
        .route("/diagnose", post(diagnose_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// A bound listener plus the router it will serve.
pub struct ApiServer {
    listener: TcpListener,
    app: Router,
}

impl ApiServer {
    /// Binds `addr`; a leading `:` means all interfaces.
    pub async fn bind(addr: &str, state: AppState) -> Result<Self> {
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        Ok(Self {
            listener,
            app: router(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("getting local address")
    }

    /// Serves until `cancel` fires, then drains in-flight requests.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let local_addr = self.local_addr()?;
        tracing::info!(addr = %local_addr, "api server started");

        axum::serve(
            self.listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .context("serving api")?;

        tracing::info!("api server stopped");
        Ok(())
    }
}

fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

/// Handler failure mapped to a status code and a JSON error body.
enum ApiError {
    Service(ServiceError),
    Internal(String),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Service(e @ ServiceError::NotFound { .. }) => (StatusCode::NOT_FOUND, e.to_string()),
            Self::Service(e @ ServiceError::Store(StoreError::Unavailable(_))) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            Self::Service(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        if status.is_server_error() {
            tracing::error!(status = %status, error = %message, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// POST /ingest - store one frame.
async fn ingest_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<IngestRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers);
    let service = Arc::clone(&state.service);
    tokio::task::spawn_blocking(move || service.ingest(&user, &req)).await??;
    Ok(Json(json!({ "status": "ok" })))
}

/// POST /diagnose - analyze a stored scenario.
async fn diagnose_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DiagnoseRequest>,
) -> Result<Response, ApiError> {
    let user = user_id(&headers);
    let service = Arc::clone(&state.service);
    let report =
        tokio::task::spawn_blocking(move || service.diagnose(&user, &req.scenario_id)).await??;
    Ok(Json(report).into_response())
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
