// src/supervisor/mod.rs

//! Controller/supervisor protocol
//!
//! The controller (main API) never runs installers itself when an updater
//! service is configured: an install may replace the controller's own code
//! and restart it. Instead it asks a supervisor to launch the installer.
//!
//! ```text
//! controller                         updater service (supervisor)
//!     │  POST /install {filename, backup}   │
//!     ├────────────────────────────────────►│ validate, setsid, spawn
//!     │◄──────── 200 LaunchReceipt ─────────┤ (returns immediately)
//!     │                                     │
//!     │  GET /installs/{filename}           │
//!     ├────────────────────────────────────►│ log tail + exit marker
//!     │◄──────── 200 InstallProgress ───────┤
//! ```
//!
//! - [`HttpSupervisor`] speaks this protocol to a running updater service.
//! - [`LocalSupervisor`] launches in-process; used when no updater URL is
//!   configured.

pub mod launcher;

pub use launcher::{Launcher, AUTO_FLAG, BACKUP_TAKEN_ENV};

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Warning attached to every install acknowledgment
pub const INSTALL_WARNING: &str =
    "Services will restart during installation; the connection may drop. Reload the page after a few minutes.";

/// Note attached to every install acknowledgment
pub const INSTALL_NOTE: &str = "The service will restart in about 2-5 minutes.";

/// Ask the supervisor to run an installer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub filename: String,
    /// Backup already created for this install, if any
    #[serde(default)]
    pub backup: Option<String>,
}

/// Acknowledgment that an installer was started
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchReceipt {
    pub success: bool,
    pub message: String,
    pub filename: String,
    pub log_file: PathBuf,
    #[serde(default)]
    pub pid: Option<u32>,
    pub note: String,
    pub warning: String,
}

impl LaunchReceipt {
    pub fn started(filename: &str, log_file: &Path, pid: Option<u32>) -> Self {
        Self {
            success: true,
            message: "Installation started in background".to_string(),
            filename: filename.to_string(),
            log_file: log_file.to_path_buf(),
            pid,
            note: INSTALL_NOTE.to_string(),
            warning: INSTALL_WARNING.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    /// No longer running and no exit code was recorded
    Lost,
}

/// Observed state of a detached install
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallProgress {
    pub filename: String,
    pub state: InstallState,
    pub exit_code: Option<i32>,
    pub log_file: PathBuf,
    #[serde(default)]
    pub log_tail: Vec<String>,
}

/// Something that can start installers and report on them
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Start the installer and return without waiting for it
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchReceipt>;

    /// Poll what the installer has done so far
    async fn install_status(&self, filename: &str) -> Result<InstallProgress>;
}

/// In-process supervisor
#[derive(Clone)]
pub struct LocalSupervisor {
    launcher: Launcher,
}

impl LocalSupervisor {
    pub fn new(launcher: Launcher) -> Self {
        Self { launcher }
    }
}

#[async_trait]
impl Supervisor for LocalSupervisor {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchReceipt> {
        let launcher = self.launcher.clone();
        tokio::task::spawn_blocking(move || launcher.launch(&request))
            .await
            .map_err(|e| Error::SpawnFailed(format!("Launch task join error: {}", e)))?
    }

    async fn install_status(&self, filename: &str) -> Result<InstallProgress> {
        let launcher = self.launcher.clone();
        let filename = filename.to_string();
        tokio::task::spawn_blocking(move || launcher.status(&filename))
            .await
            .map_err(|e| Error::IoError(format!("Status task join error: {}", e)))?
    }
}

/// Supervisor reached over HTTP (the updater service)
#[derive(Clone)]
pub struct HttpSupervisor {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Problem {
    #[serde(default)]
    detail: String,
}

impl HttpSupervisor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Map an updater error response back onto our error type
    async fn error_from(response: reqwest::Response) -> Error {
        let status = response.status();
        let detail = response
            .json::<Problem>()
            .await
            .map(|p| p.detail)
            .unwrap_or_else(|_| format!("updater returned HTTP {}", status));

        match status.as_u16() {
            400 => Error::InvalidPath(detail),
            404 => Error::NotFound(detail),
            409 => Error::Conflict(detail),
            _ => Error::SpawnFailed(detail),
        }
    }
}

#[async_trait]
impl Supervisor for HttpSupervisor {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchReceipt> {
        let url = format!("{}/install", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::SpawnFailed(format!("Updater service unreachable at {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| Error::ParseError(format!("Bad updater response: {}", e)))
    }

    async fn install_status(&self, filename: &str) -> Result<InstallProgress> {
        let url = format!("{}/installs/{}", self.base_url, filename);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| Error::ParseError(format!("Bad updater response: {}", e)))
    }
}
