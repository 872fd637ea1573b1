// src/config.rs
//! Configuration file parsing for the update subsystem
//!
//! Supports TOML configuration files with the following sections:
//! - [server] - Controller API bind address and CORS
//! - [updater] - Updater service bind address, URL and lock file
//! - [paths] - Staging, backup, install, version and history locations
//! - [remote] - Remote version source URL and timeouts
//! - [backup] - Retention, exclusions and services to pause
//! - [upload] - Upload size limit
//! - [install] - Services to restart and paths preserved across updates
//! - [auth] - Admin token and session lifetime
//!
//! Every field has a default, so an empty file (or no file) yields a
//! working configuration for a stock appliance.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/armnas/armnas.toml";

/// Environment variable overriding `remote.url`
pub const UPDATE_SERVER_URL_ENV: &str = "UPDATE_SERVER_URL";

/// Unit hosting the controller; the controller never stops it
pub const CONTROLLER_SERVICE: &str = "armnas-backend";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArmnasConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub updater: UpdaterSection,

    #[serde(default)]
    pub paths: PathsSection,

    #[serde(default)]
    pub remote: RemoteSection,

    #[serde(default)]
    pub backup: BackupSection,

    #[serde(default)]
    pub upload: UploadSection,

    #[serde(default)]
    pub install: InstallSection,

    #[serde(default)]
    pub auth: AuthSection,
}

/// Controller API section
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Controller API bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

/// Updater service section
#[derive(Debug, Clone, Deserialize)]
pub struct UpdaterSection {
    /// Updater service bind address
    #[serde(default = "default_updater_bind")]
    pub bind: String,

    /// URL the controller uses to reach the updater service.
    /// When unset the controller launches installers itself.
    #[serde(default)]
    pub url: Option<String>,

    /// Lock file held while the updater service runs
    #[serde(default = "default_updater_lock")]
    pub lock_path: PathBuf,

    /// Timeout for controller → updater requests
    #[serde(default = "default_updater_timeout")]
    pub timeout: String,
}

impl Default for UpdaterSection {
    fn default() -> Self {
        Self {
            bind: default_updater_bind(),
            url: None,
            lock_path: default_updater_lock(),
            timeout: default_updater_timeout(),
        }
    }
}

fn default_updater_bind() -> String {
    "0.0.0.0:8001".to_string()
}

fn default_updater_lock() -> PathBuf {
    PathBuf::from("/run/armnas/updater.lock")
}

fn default_updater_timeout() -> String {
    "30s".to_string()
}

/// Filesystem layout section
#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    /// Staging directory for uploaded and downloaded packages
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Backup archive directory
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Installation directory
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Single-line installed version file (default: `<install_dir>/VERSION`)
    #[serde(default)]
    pub version_file: Option<PathBuf>,

    /// Append-only install history log
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,

    /// Lock file held by a running installer
    #[serde(default = "default_install_lock")]
    pub install_lock: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            backup_dir: default_backup_dir(),
            install_dir: default_install_dir(),
            version_file: None,
            history_file: default_history_file(),
            install_lock: default_install_lock(),
        }
    }
}

impl PathsSection {
    /// Resolved version file path
    pub fn version_file(&self) -> PathBuf {
        self.version_file
            .clone()
            .unwrap_or_else(|| self.install_dir.join("VERSION"))
    }
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/tmp/armnas_updates")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/opt/armnas/backups")
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("/opt/armnas")
}

fn default_history_file() -> PathBuf {
    PathBuf::from("/var/log/armnas/update_history.log")
}

fn default_install_lock() -> PathBuf {
    PathBuf::from("/run/armnas/install.lock")
}

/// Remote version source section
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
    /// Base URL of the version registry
    #[serde(default = "default_remote_url")]
    pub url: String,

    /// Timeout for check and changelog requests
    #[serde(default = "default_remote_timeout")]
    pub timeout: String,

    /// Connect timeout for package downloads
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Total timeout for a package download
    #[serde(default = "default_download_timeout")]
    pub download_timeout: String,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            url: default_remote_url(),
            timeout: default_remote_timeout(),
            connect_timeout: default_connect_timeout(),
            download_timeout: default_download_timeout(),
        }
    }
}

fn default_remote_url() -> String {
    "http://localhost:5000/api/v1".to_string()
}

fn default_remote_timeout() -> String {
    "10s".to_string()
}

fn default_connect_timeout() -> String {
    "30s".to_string()
}

fn default_download_timeout() -> String {
    "30m".to_string()
}

/// Backup section
#[derive(Debug, Clone, Deserialize)]
pub struct BackupSection {
    /// Number of backups retained after rotation
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Glob patterns (relative to the install dir) left out of archives
    #[serde(default = "default_backup_exclude")]
    pub exclude: Vec<String>,

    /// Services stopped while the installer or CLI writes an archive
    #[serde(default = "default_managed_services")]
    pub pause_services: Vec<String>,

    /// Services the controller stops around its own pre-update archive
    #[serde(default)]
    pub controller_pause_services: Vec<String>,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            max_backups: default_max_backups(),
            exclude: default_backup_exclude(),
            pause_services: default_managed_services(),
            controller_pause_services: Vec::new(),
        }
    }
}

fn default_max_backups() -> usize {
    5
}

fn default_backup_exclude() -> Vec<String> {
    [
        "backend/__pycache__",
        "**/__pycache__",
        "*.pyc",
        "*.pyo",
        "backend/venv",
        "*.log",
        "backend/logs",
        "backups",
        "tmp",
        ".git*",
        "frontend/node_modules",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_managed_services() -> Vec<String> {
    vec![CONTROLLER_SERVICE.to_string(), "nginx".to_string()]
}

/// Upload section
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    /// Maximum package size (e.g. "500MB")
    #[serde(default = "default_max_upload")]
    pub max_size: String,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            max_size: default_max_upload(),
        }
    }
}

fn default_max_upload() -> String {
    "500MB".to_string()
}

/// Installer section
#[derive(Debug, Clone, Deserialize)]
pub struct InstallSection {
    /// Services restarted once files are in place (in order)
    #[serde(default = "default_restart_services")]
    pub services: Vec<String>,

    /// Paths (relative to the install dir) kept across backend replacement
    #[serde(default = "default_preserve")]
    pub preserve: Vec<String>,

    /// Timeout for each external command the installer runs
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,
}

impl Default for InstallSection {
    fn default() -> Self {
        Self {
            services: default_restart_services(),
            preserve: default_preserve(),
            command_timeout: default_command_timeout(),
        }
    }
}

fn default_restart_services() -> Vec<String> {
    vec!["nginx".to_string(), "armnas-backend".to_string()]
}

fn default_preserve() -> Vec<String> {
    vec![
        "backend/venv".to_string(),
        "backend/armnas.db".to_string(),
        "backend/config.py".to_string(),
    ]
}

fn default_command_timeout() -> String {
    "10m".to_string()
}

/// Authentication section
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Static admin token; auth is disabled when unset
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Lifetime of issued sessions
    #[serde(default = "default_session_ttl")]
    pub session_ttl: String,

    /// Interval of the expired-session sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            admin_token: None,
            session_ttl: default_session_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_session_ttl() -> String {
    "12h".to_string()
}

fn default_sweep_interval() -> String {
    "5m".to_string()
}

impl ArmnasConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: ArmnasConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        tracing::debug!("No config at {}, using defaults", path.display());
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(UPDATE_SERVER_URL_ENV)
            && !url.trim().is_empty()
        {
            self.remote.url = url.trim().to_string();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid server.bind address: {}", self.server.bind))?;

        self.updater
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid updater.bind address: {}", self.updater.bind))?;

        url::Url::parse(&self.remote.url)
            .with_context(|| format!("Invalid remote.url: {}", self.remote.url))?;

        if let Some(ref updater_url) = self.updater.url {
            url::Url::parse(updater_url)
                .with_context(|| format!("Invalid updater.url: {}", updater_url))?;
        }

        if self.backup.max_backups == 0 {
            anyhow::bail!("backup.max_backups must be at least 1");
        }

        if self.max_upload_bytes()? == 0 {
            anyhow::bail!("upload.max_size must be greater than zero");
        }

        for pattern in &self.backup.exclude {
            glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid backup.exclude pattern: {}", pattern))?;
        }

        self.remote_timeout()?;
        self.download_timeout()?;
        self.session_ttl()?;

        Ok(())
    }

    pub fn server_bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid server bind address: {}", self.server.bind))
    }

    pub fn updater_bind_addr(&self) -> Result<SocketAddr> {
        self.updater
            .bind
            .parse()
            .with_context(|| format!("Invalid updater bind address: {}", self.updater.bind))
    }

    pub fn max_upload_bytes(&self) -> Result<u64> {
        parse_size(&self.upload.max_size)
    }

    pub fn remote_timeout(&self) -> Result<Duration> {
        parse_duration(&self.remote.timeout)
    }

    pub fn connect_timeout(&self) -> Result<Duration> {
        parse_duration(&self.remote.connect_timeout)
    }

    pub fn download_timeout(&self) -> Result<Duration> {
        parse_duration(&self.remote.download_timeout)
    }

    pub fn updater_timeout(&self) -> Result<Duration> {
        parse_duration(&self.updater.timeout)
    }

    pub fn command_timeout(&self) -> Result<Duration> {
        parse_duration(&self.install.command_timeout)
    }

    pub fn session_ttl(&self) -> Result<Duration> {
        parse_duration(&self.auth.session_ttl)
    }

    pub fn sweep_interval(&self) -> Result<Duration> {
        parse_duration(&self.auth.sweep_interval)
    }

    /// Directories that must exist before serving
    pub fn runtime_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.paths.staging_dir.clone(), self.paths.backup_dir.clone()];
        if let Some(parent) = self.paths.history_file.parent() {
            dirs.push(parent.to_path_buf());
        }
        dirs
    }
}

/// Parse a human-readable size string (e.g., "500MB", "1GB", "512KB")
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("GB") {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1024u64 * 1024)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid size number: {}", num_str))?;

    Ok((num * multiplier as f64) as u64)
}

/// Parse a human-readable duration string (e.g., "10s", "30m", "12h")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('d') {
        (n, 24 * 60 * 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration number: {}", num_str))?;

    Ok(Duration::from_secs(num * multiplier))
}
