//! REST + WebSocket facade.
//!
//! Every endpoint runs behind a role check (admin or viewer bearer
//! tokens from the config); errors leave as the envelope
//! `{error:{code,message,details}}`. The WebSocket at `/ws`
//! authenticates the token from the query string and fans bus events out
//! as `{type, payload}` frames.

mod routes;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{JupiterConfig, Role};
use crate::error::{JupiterError, Result};
use crate::events::EventBus;
use crate::graph::DependencyGraph;
use crate::jobs::JobManager;
use crate::license::LicenseAdapter;
use crate::plugins::permissions::AuditLog;
use crate::plugins::PluginBridge;
use crate::project::ProjectManager;

/// Aggregate request counters for `/metrics`.
#[derive(Default)]
pub struct ApiCounters {
    pub scans_total: AtomicU64,
    pub analyzes_total: AtomicU64,
    pub runs_total: AtomicU64,
    pub ws_clients: AtomicU64,
}

/// Shared state behind every handler.
pub struct ApiState {
    /// Active project root. Handlers hold the read side for their whole
    /// request; switching projects takes the write side, which is the
    /// CONFIG_UPDATED happens-before barrier from the concurrency
    /// model.
    pub root: tokio::sync::RwLock<PathBuf>,
    pub config: tokio::sync::RwLock<JupiterConfig>,
    pub bus: Arc<EventBus>,
    pub jobs: Arc<JobManager>,
    pub license: Arc<LicenseAdapter>,
    pub bridge: Arc<PluginBridge>,
    pub projects: Arc<ProjectManager>,
    pub audit: AuditLog,
    /// Graph from the most recent scan-producing request; the removal
    /// simulator runs against this.
    pub latest_graph: tokio::sync::RwLock<Option<DependencyGraph>>,
    pub counters: ApiCounters,
}

/// Caller identity resolved from a bearer token.
#[derive(Clone, Debug)]
pub struct AuthInfo {
    pub role: Role,
    /// Leading characters of the token, for the audit log.
    pub token_id: String,
}

/// Resolve and check the caller's role from `Authorization: Bearer`.
pub fn authorize(config: &JupiterConfig, headers: &HeaderMap, min_role: Role) -> Result<AuthInfo> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| JupiterError::Auth("missing bearer token".to_string()))?;
    authorize_token(config, token, min_role)
}

/// Token-level check, shared with the WebSocket query path.
pub fn authorize_token(config: &JupiterConfig, token: &str, min_role: Role) -> Result<AuthInfo> {
    let role = config
        .role_for_token(token)
        .ok_or_else(|| JupiterError::Auth("invalid token".to_string()))?;
    if role < min_role {
        return Err(JupiterError::Auth(format!(
            "requires {min_role:?} role"
        )));
    }
    Ok(AuthInfo {
        role,
        token_id: token.chars().take(8).collect(),
    })
}

/// Error envelope wrapper.
pub struct ApiError(pub JupiterError);

impl From<JupiterError> for ApiError {
    fn from(err: JupiterError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut details = serde_json::Value::Null;
        if matches!(self.0, JupiterError::Internal(_)) {
            let correlation_id = uuid::Uuid::new_v4().to_string();
            error!(correlation_id, error = %self.0, "internal error");
            details = serde_json::json!({ "correlation_id": correlation_id });
        }
        let body = serde_json::json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
                "details": details,
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router over shared state.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .route("/scan", post(routes::scan))
        .route("/analyze", get(routes::analyze))
        .route("/ci", post(routes::ci))
        .route("/run", post(routes::run))
        .route("/snapshots", get(routes::snapshots_list))
        .route("/snapshots/diff", get(routes::snapshots_diff))
        .route("/snapshots/:id", get(routes::snapshots_show))
        .route("/simulate/remove", post(routes::simulate_remove))
        .route("/graph", get(routes::graph))
        .route("/plugins", get(routes::plugins_list))
        .route("/plugins/install", post(routes::plugins_install))
        .route("/plugins/:id/toggle", post(routes::plugins_toggle))
        .route(
            "/plugins/:id/config",
            get(routes::plugin_config_get).post(routes::plugin_config_set),
        )
        .route("/plugins/:id/reload", post(routes::plugins_reload))
        .route("/license/status", get(routes::license_status))
        .route("/license/refresh", post(routes::license_refresh))
        .route("/config", get(routes::config_get).post(routes::config_set))
        .route("/fs/list", get(routes::fs_list))
        .route("/projects", get(routes::projects_list))
        .route("/projects/:id/activate", post(routes::projects_activate))
        .route("/ws", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<ApiState>) -> Result<()> {
    let (host, port) = {
        let config = state.config.read().await;
        (config.server.host.clone(), config.server.port)
    };
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| JupiterError::Validation(format!("bad server address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| JupiterError::Internal(format!("bind {addr}: {e}")))?;
    info!(%addr, "jupiter api listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| JupiterError::Internal(e.to_string()))
}
