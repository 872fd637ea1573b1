// src/updater/routes.rs

//! Axum router for the updater service
//!
//! - `GET /` - service description
//! - `GET /status` - staging and backup summary
//! - `POST /upload` - multipart `file`
//! - `GET /downloads`, `DELETE /downloads/:filename`
//! - `GET /backups`, `DELETE /backups/:filename`
//! - `POST /install` - detach an installer
//! - `GET /installs/:filename` - log tail and exit state

use crate::api::{blocking, receive_upload, ActionResponse, ApiResult};
use crate::backup::BackupRecord;
use crate::store::Package;
use crate::supervisor::{InstallProgress, LaunchReceipt, LaunchRequest};
use crate::updater::SharedState;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use std::path::PathBuf;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub endpoints: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct UpdaterStatus {
    pub status: &'static str,
    pub staging_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub packages: usize,
    pub backups: usize,
    pub uptime_secs: u64,
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(info_handler))
        .route("/status", get(status_handler))
        .route("/upload", post(upload_handler).layer(DefaultBodyLimit::disable()))
        .route("/downloads", get(list_downloads_handler))
        .route("/downloads/:filename", delete(delete_download_handler))
        .route("/backups", get(list_backups_handler))
        .route("/backups/:filename", delete(delete_backup_handler))
        .route("/install", post(install_handler))
        .route("/installs/:filename", get(install_status_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// GET /
async fn info_handler() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "armnas-updater",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec![
            "GET /status",
            "POST /upload",
            "GET /downloads",
            "DELETE /downloads/{filename}",
            "GET /backups",
            "DELETE /backups/{filename}",
            "POST /install",
            "GET /installs/{filename}",
        ],
    })
}

/// GET /status
async fn status_handler(State(state): State<SharedState>) -> ApiResult<Json<UpdaterStatus>> {
    let packages = state.store().list().await?.len();
    let backups = state.backups.clone();
    let backup_count = blocking(move || backups.list()).await?.len();

    Ok(Json(UpdaterStatus {
        status: "running",
        staging_dir: state.store().staging_dir().to_path_buf(),
        backup_dir: state.backups.backup_dir().to_path_buf(),
        packages,
        backups: backup_count,
        uptime_secs: state.started.elapsed().as_secs(),
    }))
}

/// POST /upload
async fn upload_handler(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> ApiResult<Json<Package>> {
    Ok(Json(receive_upload(state.store(), multipart).await?))
}

/// GET /downloads
async fn list_downloads_handler(State(state): State<SharedState>) -> ApiResult<Json<Vec<Package>>> {
    Ok(Json(state.store().list().await?))
}

/// DELETE /downloads/:filename
async fn delete_download_handler(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    state.store().delete(&filename).await?;
    Ok(ActionResponse::ok(format!("Deleted {}", filename)))
}

/// GET /backups
async fn list_backups_handler(State(state): State<SharedState>) -> ApiResult<Json<Vec<BackupRecord>>> {
    let backups = state.backups.clone();
    Ok(Json(blocking(move || backups.list()).await?))
}

/// DELETE /backups/:filename
async fn delete_backup_handler(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    let backups = state.backups.clone();
    let name = filename.clone();
    blocking(move || backups.delete(&name)).await?;
    Ok(ActionResponse::ok(format!("Deleted {}", filename)))
}

/// POST /install
///
/// Returns once the installer is running; it keeps going if this service
/// stops.
async fn install_handler(
    State(state): State<SharedState>,
    Json(request): Json<LaunchRequest>,
) -> ApiResult<Json<LaunchReceipt>> {
    let launcher = state.launcher.clone();
    Ok(Json(blocking(move || launcher.launch(&request)).await?))
}

/// GET /installs/:filename
async fn install_status_handler(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> ApiResult<Json<InstallProgress>> {
    let launcher = state.launcher.clone();
    Ok(Json(blocking(move || launcher.status(&filename)).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use crate::store::PackageStore;
    use crate::updater::UpdaterState;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir) -> Router {
        let state = UpdaterState::new(
            PackageStore::new(dir.path().join("staging")),
            BackupManager::new(dir.path().join("backups"), dir.path().join("armnas")),
        );
        build_router(Arc::new(state))
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_info_and_status() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["service"], "armnas-updater");

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = json(response).await;
        assert_eq!(status["packages"], 0);
        assert_eq!(status["backups"], 0);
    }

    #[tokio::test]
    async fn test_install_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        for (name, expected) in [
            ("../../etc/passwd", StatusCode::BAD_REQUEST),
            ("update.sh", StatusCode::BAD_REQUEST),
            ("missing.run", StatusCode::NOT_FOUND),
        ] {
            let request = Request::builder()
                .method("POST")
                .uri("/install")
                .header("content-type", "application/json")
                .body(Body::from(format!(r#"{{"filename": "{}"}}"#, name)))
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), expected, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_delete_backup_twice() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("backups")).unwrap();
        std::fs::write(dir.path().join("backups/backup_20240101_000000.tar.gz"), b"x").unwrap();
        let app = app(&dir);

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri("/backups/backup_20240101_000000.tar.gz")
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(app.clone().oneshot(delete()).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.oneshot(delete()).await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_install_status_not_started() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir)
            .oneshot(
                Request::builder()
                    .uri("/installs/update.run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["state"], "not_started");
    }
}
