// src/api/mod.rs

//! Controller HTTP API
//!
//! Serves the update endpoints the appliance UI talks to:
//!
//! - `/health` - liveness, no auth
//! - `/api/auth/login` - exchange the admin token for a session cookie
//! - `/api/updates/*` - update status, packages, installs, backups, history
//!
//! Errors are returned as RFC 7807 problem documents
//! (`application/problem+json`), see [`ApiProblem`].

pub mod routes;

pub use routes::build_router;

use crate::auth::{self, MemorySessionStore, Session, SessionStore};
use crate::config::ArmnasConfig;
use crate::error::Error;
use crate::orchestrator::UpdateOrchestrator;
use crate::store::{Package, PackageStore};
use anyhow::Context;
use axum::extract::Multipart;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Multipart field carrying an uploaded package
pub const UPLOAD_FIELD: &str = "file";

/// Error response format (RFC 7807)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiProblem {
    /// Error type URI
    #[serde(rename = "type")]
    pub error_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    /// The request that caused the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

impl ApiProblem {
    pub fn new(error_type: &str, title: &str, status: u16, detail: &str) -> Self {
        Self {
            error_type: format!("urn:armnas:error:{}", error_type),
            title: title.to_string(),
            status,
            detail: detail.to_string(),
            instance: None,
            extensions: None,
        }
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new("not_found", "Not Found", 404, &format!("{} not found", resource))
    }

    pub fn conflict(detail: &str) -> Self {
        Self::new("conflict", "Conflict", 409, detail)
    }

    pub fn internal(detail: &str) -> Self {
        Self::new("internal", "Internal Error", 500, detail)
    }

    pub fn bad_request(detail: &str) -> Self {
        Self::new("bad_request", "Bad Request", 400, detail)
    }

    pub fn unauthorized(detail: &str) -> Self {
        Self::new("unauthorized", "Unauthorized", 401, detail)
    }

    pub fn payload_too_large(detail: &str) -> Self {
        Self::new("payload_too_large", "Payload Too Large", 413, detail)
    }

    pub fn with_instance(mut self, instance: String) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_extensions(mut self, extensions: serde_json::Value) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

impl From<&Error> for ApiProblem {
    fn from(err: &Error) -> Self {
        let detail = err.to_string();
        match err {
            Error::TooLarge { limit } => Self::payload_too_large(&detail)
                .with_extensions(serde_json::json!({ "limit": limit })),
            Error::ChecksumMismatch { expected, actual } => {
                Self::new("checksum_mismatch", "Checksum Mismatch", 400, &detail).with_extensions(
                    serde_json::json!({ "expected": expected, "actual": actual, "purged": true }),
                )
            }
            e if e.is_validation() => Self::bad_request(&detail),
            Error::NotFound(_) => Self::new("not_found", "Not Found", 404, &detail),
            Error::Conflict(_) => Self::conflict(&detail),
            e if e.is_external_tool() => Self::new("external_tool", "External Tool Failed", 500, &detail),
            Error::DownloadError(_) => Self::new("upstream", "Bad Gateway", 502, &detail),
            _ => Self::internal(&detail),
        }
    }
}

/// Error response wrapper for handlers
#[derive(Debug)]
pub struct ApiError(pub ApiProblem);

impl From<ApiProblem> for ApiError {
    fn from(problem: ApiProblem) -> Self {
        ApiError(problem)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        if !(err.is_validation() || matches!(err, Error::NotFound(_) | Error::Conflict(_))) {
            tracing::warn!("Request failed: {}", err);
        }
        ApiError(ApiProblem::from(&err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (
            status,
            [("content-type", "application/problem+json")],
            Json(&self.0),
        )
            .into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// Run blocking filesystem work off the async executor
pub(crate) async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(ApiProblem::internal(&format!("Task join error: {}", e))))?
        .map_err(ApiError::from)
}

/// Stream the `file` field of a multipart upload into the package store
pub(crate) async fn receive_upload(store: &PackageStore, mut multipart: Multipart) -> ApiResult<Package> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiProblem::bad_request(&format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| Error::MissingField("filename".to_string()))?;

        return Ok(store.store_stream(&filename, field).await?);
    }

    Err(Error::MissingField(UPLOAD_FIELD.to_string()).into())
}

/// Generic success body
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

/// Shared controller state
pub struct AppState {
    pub orchestrator: UpdateOrchestrator,
    /// `None` when no admin token is configured
    pub sessions: Option<Arc<dyn SessionStore>>,
    pub session_ttl: Duration,
    pub started: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(orchestrator: UpdateOrchestrator) -> Self {
        Self {
            orchestrator,
            sessions: None,
            session_ttl: Duration::from_secs(12 * 3600),
            started: Instant::now(),
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        self.sessions = Some(sessions);
        self.session_ttl = ttl;
        self
    }
}

/// Start the controller API
pub async fn run_server(config: ArmnasConfig) -> anyhow::Result<()> {
    let addr = config.server_bind_addr()?;
    tracing::info!("Starting armnas controller {} on {}", env!("CARGO_PKG_VERSION"), addr);
    tracing::info!("Staging directory: {:?}", config.paths.staging_dir);
    tracing::info!("Backup directory: {:?}", config.paths.backup_dir);
    tracing::info!("Update registry: {}", config.remote.url);

    let orchestrator = UpdateOrchestrator::from_config(&config).context("Failed to set up updates")?;
    let mut state = AppState::new(orchestrator);

    match config.auth.admin_token {
        Some(ref token) if !token.is_empty() => {
            let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
            store.insert(token.clone(), Session::permanent("admin"));
            auth::spawn_sweeper(store.clone(), config.sweep_interval()?);
            state = state.with_sessions(store, config.session_ttl()?);
        }
        _ => tracing::warn!("No [auth] admin_token configured; the update API is unauthenticated"),
    }

    let app = build_router(Arc::new(state), &config.server.cors_origins);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Controller ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Controller shut down");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = term => {}
    }
    tracing::info!("Received shutdown signal");
}
