// src/api/routes.rs

//! Axum router for the controller API
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | GET | `/health` | liveness |
//! | POST | `/api/auth/login` | admin token to session cookie |
//! | GET | `/api/updates/status` | pipeline status |
//! | GET | `/api/updates/check-updates` | ask the registry |
//! | POST | `/api/updates/upload` | multipart `file` |
//! | POST | `/api/updates/download` | fetch by URL, or the latest release |
//! | POST | `/api/updates/install` | back up and launch |
//! | GET | `/api/updates/backups` | list archives |
//! | POST | `/api/updates/restore` | manual restore instructions |
//! | DELETE | `/api/updates/backups/:filename` | delete an archive |
//! | GET | `/api/updates/downloads` | staged packages |
//! | DELETE | `/api/updates/downloads/:filename` | delete a package |
//! | GET | `/api/updates/history` | installer history |
//! | GET | `/api/updates/changelog/:version` | registry changelog |

use crate::api::{blocking, receive_upload, ActionResponse, ApiProblem, ApiResult, SharedState};
use crate::auth::{self, Session, SESSION_COOKIE};
use crate::backup::{BackupRecord, RestorePlan};
use crate::error::Error;
use crate::history::{UpdateRecord, DEFAULT_LIMIT};
use crate::orchestrator::{CheckResult, StatusSnapshot};
use crate::store::{FetchOutcome, Package};
use crate::supervisor::LaunchReceipt;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::HeaderValue;
use axum::middleware;
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Upper bound for `?limit=` on history
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub current_version: String,
    pub pid: u32,
    pub uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub current_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// `url` absent means "download the latest release the registry offers"
#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub url: Option<String>,
    pub filename: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub outcome: FetchOutcome,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub package: Package,
}

#[derive(Debug, Deserialize)]
pub struct FilenameRequest {
    pub filename: String,
}

/// Build the controller router
///
/// With sessions configured every `/api/updates` route requires one.
pub fn build_router(state: SharedState, cors_origins: &[String]) -> Router {
    let mut updates = build_updates_router();
    if let Some(ref sessions) = state.sessions {
        updates = updates.route_layer(middleware::from_fn_with_state(
            sessions.clone(),
            auth::require_session,
        ));
    }

    Router::new()
        // Health check (no auth required)
        .route("/health", get(health_handler))
        .route("/api/auth/login", post(login_handler))
        .nest("/api/updates", updates)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
}

fn build_updates_router() -> Router<SharedState> {
    Router::new()
        .route("/status", get(status_handler))
        .route("/check-updates", get(check_updates_handler))
        // Size is enforced while streaming into the store
        .route("/upload", post(upload_handler).layer(DefaultBodyLimit::disable()))
        .route("/download", post(download_handler))
        .route("/install", post(install_handler))
        .route("/backups", get(list_backups_handler))
        .route("/backups/:filename", delete(delete_backup_handler))
        .route("/restore", post(restore_handler))
        .route("/downloads", get(list_downloads_handler))
        .route("/downloads/:filename", delete(delete_download_handler))
        .route("/history", get(history_handler))
        .route("/changelog/:version", get(changelog_handler))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// =============================================================================
// Health & Auth
// =============================================================================

/// GET /health
async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        current_version: state.orchestrator.current_version(),
        pid: std::process::id(),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

/// POST /api/auth/login
///
/// Trades the admin token for an expiring session cookie.
async fn login_handler(
    State(state): State<SharedState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let Some(ref sessions) = state.sessions else {
        return Err(ApiProblem::bad_request("Authentication is not enabled").into());
    };

    match sessions.get(&request.token) {
        Some(session) if session.expires_at.is_none() => {
            let session = Session::expiring(session.identity, state.session_ttl);
            let expires_at = session.expires_at;
            let token = sessions.issue(session);

            let cookie = format!(
                "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
                SESSION_COOKIE,
                token,
                state.session_ttl.as_secs()
            );
            let cookie = HeaderValue::from_str(&cookie)
                .map_err(|e| ApiProblem::internal(&format!("Bad cookie header: {}", e)))?;

            Ok((
                [(SET_COOKIE, cookie)],
                Json(LoginResponse {
                    success: true,
                    expires_at,
                }),
            ))
        }
        _ => Err(ApiProblem::unauthorized("Invalid admin token").into()),
    }
}

// =============================================================================
// Status & Registry
// =============================================================================

/// GET /api/updates/status
async fn status_handler(State(state): State<SharedState>) -> Json<StatusSnapshot> {
    match state.orchestrator.refresh().await {
        Ok(status) => Json(status),
        Err(e) => {
            tracing::warn!("Could not refresh install status: {}", e);
            Json(state.orchestrator.status())
        }
    }
}

/// GET /api/updates/check-updates?current_version=
async fn check_updates_handler(
    State(state): State<SharedState>,
    Query(query): Query<CheckQuery>,
) -> ApiResult<Json<CheckResult>> {
    let result = state
        .orchestrator
        .check_updates(query.current_version.as_deref())
        .await?;
    Ok(Json(result))
}

/// GET /api/updates/changelog/:version
async fn changelog_handler(
    State(state): State<SharedState>,
    Path(version): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.orchestrator.remote().changelog(&version).await?))
}

// =============================================================================
// Packages
// =============================================================================

/// POST /api/updates/upload
async fn upload_handler(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let package = receive_upload(state.orchestrator.store(), multipart).await?;
    Ok(Json(UploadResponse {
        success: true,
        message: format!("Uploaded {}", package.filename),
        package,
    }))
}

/// POST /api/updates/download
async fn download_handler(
    State(state): State<SharedState>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let orchestrator = &state.orchestrator;
    let outcome = match request.url {
        Some(ref url) => {
            let filename = request
                .filename
                .as_deref()
                .ok_or_else(|| Error::MissingField("filename".to_string()))?;
            orchestrator
                .download(url, filename, request.sha256.as_deref())
                .await?
        }
        None => orchestrator.download_latest().await?,
    };

    let message = if outcome.verified {
        format!("Downloaded and verified {}", outcome.package.filename)
    } else {
        format!(
            "Downloaded {} without checksum verification",
            outcome.package.filename
        )
    };
    Ok(Json(DownloadResponse {
        success: true,
        message,
        outcome,
    }))
}

/// GET /api/updates/downloads
async fn list_downloads_handler(State(state): State<SharedState>) -> ApiResult<Json<Vec<Package>>> {
    Ok(Json(state.orchestrator.store().list().await?))
}

/// DELETE /api/updates/downloads/:filename
async fn delete_download_handler(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    state.orchestrator.store().delete(&filename).await?;
    Ok(ActionResponse::ok(format!("Deleted {}", filename)))
}

/// POST /api/updates/install
async fn install_handler(
    State(state): State<SharedState>,
    Json(request): Json<FilenameRequest>,
) -> ApiResult<Json<LaunchReceipt>> {
    Ok(Json(state.orchestrator.install(&request.filename).await?))
}

// =============================================================================
// Backups & History
// =============================================================================

/// GET /api/updates/backups
async fn list_backups_handler(State(state): State<SharedState>) -> ApiResult<Json<Vec<BackupRecord>>> {
    let backups = state.orchestrator.backups().clone();
    Ok(Json(blocking(move || backups.list()).await?))
}

/// DELETE /api/updates/backups/:filename
async fn delete_backup_handler(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    let backups = state.orchestrator.backups().clone();
    let name = filename.clone();
    blocking(move || backups.delete(&name)).await?;
    Ok(ActionResponse::ok(format!("Deleted {}", filename)))
}

/// POST /api/updates/restore
///
/// Restores are manual: the response carries the command to run.
async fn restore_handler(
    State(state): State<SharedState>,
    Json(request): Json<FilenameRequest>,
) -> ApiResult<Json<RestorePlan>> {
    Ok(Json(state.orchestrator.restore_plan(&request.filename)?))
}

/// GET /api/updates/history?limit=
async fn history_handler(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<UpdateRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.orchestrator.recent_history(limit).await?))
}
