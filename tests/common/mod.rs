// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use armnas::api::{build_router, AppState};
use armnas::backup::BackupManager;
use armnas::history::HistoryLog;
use armnas::orchestrator::UpdateOrchestrator;
use armnas::remote::RemoteVersionSource;
use armnas::store::PackageStore;
use armnas::supervisor::{Launcher, LocalSupervisor};
use axum::body::{to_bytes, Body};
use axum::extract::Query;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const BOUNDARY: &str = "armnas-test-boundary";

/// Directory layout of a throwaway appliance
pub struct Appliance {
    pub dir: TempDir,
}

impl Appliance {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("armnas/backend")).unwrap();
        std::fs::write(dir.path().join("armnas/backend/app.py"), "print('hi')\n").unwrap();
        std::fs::write(dir.path().join("armnas/VERSION"), "0.2.0\n").unwrap();
        Self { dir }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn staging(&self) -> PathBuf {
        self.path("staging")
    }

    pub fn store(&self) -> PackageStore {
        PackageStore::new(self.staging())
    }

    pub fn backups(&self) -> BackupManager {
        BackupManager::new(self.path("backups"), self.path("armnas"))
    }

    /// Orchestrator launching installers in-process
    pub fn orchestrator(&self, registry_url: &str) -> UpdateOrchestrator {
        let remote = RemoteVersionSource::new(registry_url, Duration::from_secs(2)).unwrap();
        UpdateOrchestrator::new(
            self.store(),
            self.backups(),
            remote,
            Arc::new(LocalSupervisor::new(Launcher::new(self.store()))),
            HistoryLog::new(self.path("history.log")),
            self.path("armnas/VERSION"),
        )
    }

    /// Controller router without authentication
    pub fn controller(&self, registry_url: &str) -> Router {
        let state = AppState::new(self.orchestrator(registry_url));
        build_router(Arc::new(state), &[])
    }
}

/// An installer script that logs its arguments and writes `version`
pub fn installer_script(version_file: &Path, version: &str) -> String {
    format!(
        "#!/bin/sh\necho \"installer args: $*\"\necho \"backup: $ARMNAS_BACKUP_TAKEN\"\necho {} > {}\n",
        version,
        version_file.display()
    )
}

/// A multipart/form-data body with one `file` field
pub fn multipart_request(uri: &str, filename: &str, content: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn json_body(response: Response) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Body of every package the mock registry serves
pub const PACKAGE_BODY: &[u8] = b"#!/bin/sh\necho installing\n";

/// Serve a registry offering `latest` on 127.0.0.1; returns its API base URL
///
/// Packages are served at `/download/<name>` with [`PACKAGE_BODY`], and the
/// advertised digest matches it.
pub async fn spawn_registry(latest: &'static str) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let download_url = format!("http://{}/download/armnas_{}.run", addr, latest);

    let app = Router::new()
        .route(
            "/api/v1/check-update",
            get(move |Query(query): Query<HashMap<String, String>>| async move {
                if query.get("current_version").map(String::as_str) == Some(latest) {
                    return StatusCode::NO_CONTENT.into_response();
                }
                Json(serde_json::json!({
                    "update_available": true,
                    "latest_version": {
                        "version": latest,
                        "download_url": download_url,
                        "sha256": armnas::hash::sha256(PACKAGE_BODY),
                        "changelog": ["Faster shares", "Fixed SMB quota"],
                        "critical": false,
                        "size": PACKAGE_BODY.len(),
                        "created": "2024-06-01T12:00:00Z"
                    }
                }))
                .into_response()
            }),
        )
        .route("/download/:name", get(|| async { PACKAGE_BODY }));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/api/v1", addr)
}

/// URL of `name` on a registry started by [`spawn_registry`]
pub fn package_url(registry: &str, name: &str) -> String {
    format!("{}/download/{}", registry.trim_end_matches("/api/v1"), name)
}

/// Names in the staging directory, hidden temp files included
pub fn staged_names(staging: &Path) -> Vec<String> {
    match std::fs::read_dir(staging) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Poll `check` until it yields a value or `attempts` run out
pub async fn eventually<T, F, Fut>(attempts: usize, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..attempts {
        if let Some(value) = check().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}
