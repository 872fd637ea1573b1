// src/orchestrator/mod.rs

//! Update orchestration
//!
//! The orchestrator owns the decision flow of an update and an in-memory
//! status snapshot. It owns no files: packages belong to the
//! [`PackageStore`], archives to the [`BackupManager`], and the installer
//! runs under a [`Supervisor`].
//!
//! Install sequence:
//!
//! 1. Validate the package name
//! 2. Re-hash the staged package against the digest recorded when staged
//! 3. Archive the installation (`pre_update` + current version)
//! 4. Rotate old archives
//! 5. Hand the package to the supervisor and return at once
//!
//! The controller answers the install request before the installer gets
//! far enough to restart it. [`UpdateOrchestrator::refresh`] later picks up
//! the outcome from the supervisor.

pub mod phase;

pub use phase::UpdatePhase;

use crate::backup::{BackupManager, BackupRecord, RestorePlan};
use crate::config::{ArmnasConfig, CONTROLLER_SERVICE};
use crate::error::{Error, Result};
use crate::filesystem::path::validate_package_filename;
use crate::history::{HistoryLog, UpdateRecord, UpdateStatus, DEFAULT_LIMIT};
use crate::remote::{CheckOutcome, RemoteVersionSource, UpdateInfo};
use crate::store::{FetchOutcome, PackageStore};
use crate::supervisor::{
    HttpSupervisor, InstallState, LaunchReceipt, LaunchRequest, Launcher, LocalSupervisor, Supervisor,
};
use crate::system::{ServiceController, SystemExecutor};
use crate::version::{self, read_version_file};
use chrono::{DateTime, Local, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Default number of archives kept after rotation
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Reason recorded in the name of the archive taken before an install
pub const PRE_UPDATE_REASON: &str = "pre_update";

/// Point-in-time view of the update pipeline
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub phase: UpdatePhase,
    pub current_version: String,
    /// Package the current or last operation worked on
    pub package: Option<String>,
    /// Staged without a checksum to compare against
    pub unverified: bool,
    pub message: Option<String>,
    pub log_file: Option<PathBuf>,
    pub backup: Option<String>,
    pub latest_version: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    fn new(current_version: String) -> Self {
        Self {
            phase: UpdatePhase::Idle,
            current_version,
            package: None,
            unverified: false,
            message: None,
            log_file: None,
            backup: None,
            latest_version: None,
            last_check: None,
            updated_at: Utc::now(),
        }
    }
}

/// Answer to "is there an update?"
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub update_available: bool,
    pub current_version: String,
    pub latest_version: Option<String>,
    pub download_url: Option<String>,
    pub sha256: Option<String>,
    pub changelog: Vec<String>,
    pub critical: bool,
    pub size: Option<u64>,
    pub release_date: Option<String>,
    pub message: Option<String>,
}

impl CheckResult {
    fn none(current: &str, message: impl Into<String>) -> Self {
        Self {
            update_available: false,
            current_version: current.to_string(),
            latest_version: None,
            download_url: None,
            sha256: None,
            changelog: Vec::new(),
            critical: false,
            size: None,
            release_date: None,
            message: Some(message.into()),
        }
    }

    /// An update is only offered when it is numerically newer than `current`
    pub fn from_outcome(current: &str, outcome: CheckOutcome) -> Self {
        match outcome {
            CheckOutcome::Available(info) => {
                let newer = version::is_newer(&info.version, current);
                let message = if newer {
                    format!("Version {} is available", info.version)
                } else {
                    format!("Version {} is not newer than {}", info.version, current)
                };
                let UpdateInfo {
                    version,
                    download_url,
                    sha256,
                    changelog,
                    critical,
                    size,
                    release_date,
                } = info;
                Self {
                    update_available: newer,
                    current_version: current.to_string(),
                    latest_version: Some(version),
                    download_url: Some(download_url),
                    sha256,
                    changelog,
                    critical,
                    size,
                    release_date,
                    message: Some(message),
                }
            }
            CheckOutcome::UpToDate => Self::none(current, "System is up to date"),
            CheckOutcome::Unreachable(reason) => {
                Self::none(current, format!("Update server unreachable: {}", reason))
            }
        }
    }
}

/// Clears the in-flight flag when an install trigger finishes
struct TriggerGuard<'a>(&'a AtomicBool);

impl<'a> TriggerGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Self(flag))
            .map_err(|_| Error::Conflict("An installation is already being started".to_string()))
    }
}

impl Drop for TriggerGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct UpdateOrchestrator {
    store: PackageStore,
    backups: BackupManager,
    remote: RemoteVersionSource,
    supervisor: Arc<dyn Supervisor>,
    history: HistoryLog,
    version_file: PathBuf,
    max_backups: usize,
    status: RwLock<StatusSnapshot>,
    triggering: AtomicBool,
}

impl UpdateOrchestrator {
    pub fn new(
        store: PackageStore,
        backups: BackupManager,
        remote: RemoteVersionSource,
        supervisor: Arc<dyn Supervisor>,
        history: HistoryLog,
        version_file: impl Into<PathBuf>,
    ) -> Self {
        let version_file = version_file.into();
        let current = read_version_file(&version_file);
        info!("Current version {} (from {})", current, version_file.display());

        Self {
            store,
            backups,
            remote,
            supervisor,
            history,
            version_file,
            max_backups: DEFAULT_MAX_BACKUPS,
            status: RwLock::new(StatusSnapshot::new(current)),
            triggering: AtomicBool::new(false),
        }
    }

    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups.max(1);
        self
    }

    /// Wire every collaborator from configuration
    ///
    /// With `[updater] url` set installs go through the updater service;
    /// otherwise the controller launches them itself.
    pub fn from_config(config: &ArmnasConfig) -> anyhow::Result<Self> {
        let store = PackageStore::from_config(config)?;

        // Stopping our own unit would kill the request taking the backup
        let paused: Vec<String> = config
            .backup
            .controller_pause_services
            .iter()
            .filter(|service| {
                if service.as_str() == CONTROLLER_SERVICE {
                    warn!("Not pausing {} from the controller that runs in it", service);
                    return false;
                }
                true
            })
            .cloned()
            .collect();

        let mut backups = BackupManager::new(&config.paths.backup_dir, &config.paths.install_dir)
            .with_excludes(&config.backup.exclude)?;
        if !paused.is_empty() {
            let executor = Arc::new(SystemExecutor::new(config.command_timeout()?));
            backups = backups.with_paused_services(ServiceController::new(executor), paused);
        }

        let remote = RemoteVersionSource::new(&config.remote.url, config.remote_timeout()?)?;

        let supervisor: Arc<dyn Supervisor> = match config.updater.url {
            Some(ref url) => {
                info!("Installs will be handed to the updater service at {}", url);
                Arc::new(HttpSupervisor::new(url.as_str(), config.updater_timeout()?)?)
            }
            None => {
                warn!("No updater service configured; installs run from this process");
                Arc::new(LocalSupervisor::new(Launcher::new(store.clone())))
            }
        };

        Ok(Self::new(
            store,
            backups,
            remote,
            supervisor,
            HistoryLog::new(&config.paths.history_file),
            config.paths.version_file(),
        )
        .with_max_backups(config.backup.max_backups))
    }

    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn remote(&self) -> &RemoteVersionSource {
        &self.remote
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn current_version(&self) -> String {
        self.status.read().current_version.clone()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.read().clone()
    }

    // =========================================================================
    // Phase bookkeeping
    // =========================================================================

    /// Start an operation from a resting phase
    ///
    /// Returns the phase the pipeline was resting in.
    fn begin<F>(&self, next: UpdatePhase, update: F) -> Result<UpdatePhase>
    where
        F: FnOnce(&mut StatusSnapshot),
    {
        let mut status = self.status.write();
        let from = status.phase;
        if !from.is_resting() {
            return Err(Error::Conflict(format!(
                "An update operation is already running ({})",
                from
            )));
        }
        status.phase = from.transition(next)?;
        update(&mut status);
        status.updated_at = Utc::now();
        debug!("Update phase {} -> {}", from, next);
        Ok(from)
    }

    fn advance<F>(&self, next: UpdatePhase, update: F) -> Result<()>
    where
        F: FnOnce(&mut StatusSnapshot),
    {
        let mut status = self.status.write();
        let from = status.phase;
        status.phase = from.transition(next)?;
        update(&mut status);
        status.updated_at = Utc::now();
        debug!("Update phase {} -> {}", from, next);
        Ok(())
    }

    fn fail(&self, err: &Error) {
        let mut status = self.status.write();
        match status.phase.transition(UpdatePhase::Failed) {
            Ok(phase) => {
                warn!("Update {} failed: {}", status.phase, err);
                status.phase = phase;
                status.message = Some(err.to_string());
                status.updated_at = Utc::now();
            }
            Err(e) => warn!("Not recording failure '{}': {}", err, e),
        }
    }

    /// Return from `Checking` to the phase the check started from
    fn end_check(&self, resume: UpdatePhase, result: Option<&CheckResult>) {
        let mut status = self.status.write();
        if let Some(result) = result {
            status.last_check = Some(Utc::now());
            status.latest_version = result.latest_version.clone();
            status.message = result.message.clone();
        }
        if status.phase == UpdatePhase::Checking
            && let Ok(phase) = status.phase.transition(resume)
        {
            status.phase = phase;
            status.updated_at = Utc::now();
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Ask the registry for something newer than `current`
    ///
    /// `current` defaults to the installed version. A check made while
    /// another operation runs answers without touching the phase.
    pub async fn check_updates(&self, current: Option<&str>) -> Result<CheckResult> {
        let current = current
            .map(str::to_string)
            .unwrap_or_else(|| self.current_version());

        let resume = self
            .begin(UpdatePhase::Checking, |s| {
                s.message = Some("Checking for updates".to_string())
            })
            .ok();

        let result = self
            .remote
            .check(&current)
            .await
            .map(|outcome| CheckResult::from_outcome(&current, outcome));

        match resume {
            Some(resume) => self.end_check(resume, result.as_ref().ok()),
            None => {
                if let Ok(ref r) = result {
                    let mut status = self.status.write();
                    status.last_check = Some(Utc::now());
                    status.latest_version = r.latest_version.clone();
                }
            }
        }

        result
    }

    /// Download and stage a package
    ///
    /// With `expected` the download is verified before it becomes visible;
    /// without it the package is staged and flagged unverified.
    pub async fn download(&self, url: &str, filename: &str, expected: Option<&str>) -> Result<FetchOutcome> {
        let filename = validate_package_filename(filename)?;

        self.begin(UpdatePhase::Downloading, |s| {
            s.package = Some(filename.clone());
            s.unverified = false;
            s.log_file = None;
            s.backup = None;
            s.message = Some(format!("Downloading {}", filename));
        })?;

        let result = self.fetch_and_stage(url, &filename, expected).await;
        if let Err(ref e) = result {
            self.fail(e);
        }
        result
    }

    /// Check the registry and stage whatever newer version it offers
    pub async fn download_latest(&self) -> Result<FetchOutcome> {
        let current = self.current_version();
        let resume = self.begin(UpdatePhase::Checking, |s| {
            s.message = Some("Checking for updates".to_string())
        })?;

        let check = match self.remote.check(&current).await {
            Ok(outcome) => CheckResult::from_outcome(&current, outcome),
            Err(e) => {
                self.end_check(resume, None);
                return Err(e);
            }
        };

        let (Some(url), Some(latest), true) = (
            check.download_url.clone(),
            check.latest_version.clone(),
            check.update_available,
        ) else {
            self.end_check(resume, Some(&check));
            return Err(Error::NotFound(format!("Update newer than {}", current)));
        };

        let filename = package_name_for(&url, &latest);
        self.advance(UpdatePhase::Downloading, |s| {
            s.last_check = Some(Utc::now());
            s.latest_version = Some(latest.clone());
            s.package = Some(filename.clone());
            s.unverified = false;
            s.log_file = None;
            s.backup = None;
            s.message = Some(format!("Downloading {} ({})", filename, latest));
        })?;

        let result = self
            .fetch_and_stage(&url, &filename, check.sha256.as_deref())
            .await;
        if let Err(ref e) = result {
            self.fail(e);
        }
        result
    }

    async fn fetch_and_stage(&self, url: &str, filename: &str, expected: Option<&str>) -> Result<FetchOutcome> {
        let pending = self.store.download(url, filename).await?;

        let verified = match expected {
            Some(expected) => {
                if let Err(e) = self.advance(UpdatePhase::Verifying, |s| {
                    s.message = Some(format!("Verifying {}", filename))
                }) {
                    self.store.discard_pending(pending).await;
                    return Err(e);
                }
                self.store.verify_pending(&pending, expected).await?;
                true
            }
            None => {
                warn!("{} staged without a checksum", filename);
                false
            }
        };

        let package = self.store.commit_pending(pending).await?;
        self.advance(UpdatePhase::Staged, |s| {
            s.unverified = !verified;
            s.message = Some(if verified {
                format!("{} downloaded and verified", filename)
            } else {
                format!("{} downloaded without checksum verification", filename)
            });
        })?;

        Ok(FetchOutcome { package, verified })
    }

    /// Back up the installation and hand `filename` to the supervisor
    ///
    /// Returns as soon as the installer is running.
    pub async fn install(&self, filename: &str) -> Result<LaunchReceipt> {
        let filename = validate_package_filename(filename)?;
        let _trigger = TriggerGuard::acquire(&self.triggering)?;

        self.begin(UpdatePhase::BackingUp, |s| {
            s.package = Some(filename.clone());
            s.log_file = None;
            s.backup = None;
            s.message = Some(format!("Verifying {}", filename));
        })?;

        let result = self.backup_and_launch(&filename).await;
        if let Err(ref e) = result {
            self.fail(e);
        }
        result
    }

    async fn backup_and_launch(&self, filename: &str) -> Result<LaunchReceipt> {
        let digest = self.store.verify_staged(filename).await?;
        info!("Verified {} (sha256 {})", filename, digest);

        {
            let mut status = self.status.write();
            status.message = Some("Creating pre-update backup".to_string());
        }
        let record = self.pre_update_backup().await?;
        self.rotate_backups().await;

        self.advance(UpdatePhase::Installing, |s| {
            s.backup = Some(record.filename.clone());
            s.message = Some(format!("Installing {}", filename));
        })?;

        let receipt = self
            .supervisor
            .launch(LaunchRequest {
                filename: filename.to_string(),
                backup: Some(record.filename),
            })
            .await?;

        self.status.write().log_file = Some(receipt.log_file.clone());
        Ok(receipt)
    }

    async fn pre_update_backup(&self) -> Result<BackupRecord> {
        let backups = self.backups.clone();
        let current = self.current_version();
        tokio::task::spawn_blocking(move || backups.create_backup(Some(PRE_UPDATE_REASON), Some(&current)))
            .await
            .map_err(|e| Error::IoError(format!("Backup task join error: {}", e)))?
    }

    /// Rotation failures never block an install
    async fn rotate_backups(&self) {
        let backups = self.backups.clone();
        let max = self.max_backups;
        match tokio::task::spawn_blocking(move || backups.rotate(max)).await {
            Ok(Ok(removed)) if !removed.is_empty() => {
                info!("Rotated out {} old backup(s)", removed.len())
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Backup rotation failed: {}", e),
            Err(e) => warn!("Backup rotation task failed: {}", e),
        }
    }

    /// Pick up the outcome of a running install
    pub async fn refresh(&self) -> Result<StatusSnapshot> {
        let (package, started) = {
            let status = self.status.read();
            match (status.phase, &status.package) {
                (UpdatePhase::Installing, Some(package)) => (package.clone(), status.updated_at),
                _ => return Ok(status.clone()),
            }
        };

        let progress = self.supervisor.install_status(&package).await?;
        let (next, message) = match progress.state {
            InstallState::Succeeded => (UpdatePhase::Completed, format!("{} installed", package)),
            InstallState::Failed => (
                UpdatePhase::Failed,
                match progress.exit_code {
                    Some(code) => format!("Installer for {} exited with status {}", package, code),
                    None => format!("Installer for {} failed", package),
                },
            ),
            InstallState::Lost => self.settle_lost_install(&package, started).await,
            InstallState::Running | InstallState::NotStarted => return Ok(self.status()),
        };

        let installed = read_version_file(&self.version_file);
        let mut status = self.status.write();
        // Another refresh may have got here first
        if status.phase == UpdatePhase::Installing {
            status.phase = status.phase.transition(next)?;
            status.updated_at = Utc::now();
            status.message = Some(message);
            if next == UpdatePhase::Completed {
                info!("Install of {} complete, now at {}", package, installed);
                status.current_version = installed;
            }
        }
        Ok(status.clone())
    }

    /// Outcome of an install whose exit code was never recorded
    ///
    /// The installer appends to the history log whatever happens, so an
    /// entry for `package` written since `started` decides it.
    async fn settle_lost_install(&self, package: &str, started: DateTime<Utc>) -> (UpdatePhase, String) {
        // History dates have one-second resolution
        let since = started.with_timezone(&Local) - chrono::Duration::seconds(1);
        let record = match self.recent_history(DEFAULT_LIMIT).await {
            Ok(records) => records.into_iter().find(|r| {
                r.filename == package && r.recorded_at().is_some_and(|at| at >= since)
            }),
            Err(e) => {
                warn!("Could not read install history: {}", e);
                None
            }
        };

        match record {
            Some(record) if record.status == UpdateStatus::Success => {
                (UpdatePhase::Completed, format!("{} installed", package))
            }
            Some(record) => (
                UpdatePhase::Failed,
                format!(
                    "Installer for {} failed at {}",
                    package,
                    record.error_code.as_deref().unwrap_or("an unknown step")
                ),
            ),
            None => (
                UpdatePhase::Failed,
                format!("Installer for {} stopped without reporting a result", package),
            ),
        }
    }

    /// Most recent installer history entries
    pub async fn recent_history(&self, limit: usize) -> Result<Vec<UpdateRecord>> {
        let history = self.history.clone();
        tokio::task::spawn_blocking(move || history.read_recent(limit))
            .await
            .map_err(|e| Error::IoError(format!("History task join error: {}", e)))?
    }

    /// Manual restore instructions for a backup
    pub fn restore_plan(&self, filename: &str) -> Result<RestorePlan> {
        self.backups.restore_command(filename)
    }
}

/// Staging name for a download: the URL's file name when it is a valid
/// package name, else `armnas_<version>.run`
fn package_name_for(url: &str, version: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .and_then(|name| validate_package_filename(&name).ok())
        .unwrap_or_else(|| format!("armnas_{}.run", version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::InstallProgress;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeSupervisor {
        launched: Mutex<Vec<LaunchRequest>>,
        state: Mutex<InstallState>,
    }

    impl FakeSupervisor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                launched: Mutex::new(Vec::new()),
                state: Mutex::new(InstallState::Running),
            })
        }
    }

    #[async_trait]
    impl Supervisor for FakeSupervisor {
        async fn launch(&self, request: LaunchRequest) -> Result<LaunchReceipt> {
            let log = PathBuf::from(format!("/tmp/install_{}.log", request.filename));
            let receipt = LaunchReceipt::started(&request.filename, &log, Some(1));
            self.launched.lock().push(request);
            Ok(receipt)
        }

        async fn install_status(&self, filename: &str) -> Result<InstallProgress> {
            let state = *self.state.lock();
            Ok(InstallProgress {
                filename: filename.to_string(),
                state,
                exit_code: match state {
                    InstallState::Succeeded => Some(0),
                    InstallState::Failed => Some(2),
                    _ => None,
                },
                log_file: PathBuf::from("/tmp/x.log"),
                log_tail: Vec::new(),
            })
        }
    }

    struct Fixture {
        dir: TempDir,
        install_dir: PathBuf,
        backup_dir: PathBuf,
        supervisor: Arc<FakeSupervisor>,
        orchestrator: UpdateOrchestrator,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let install_dir = dir.path().join("armnas");
        let backup_dir = dir.path().join("backups");
        fs::create_dir_all(install_dir.join("backend")).unwrap();
        fs::write(install_dir.join("backend/main.py"), "print('hi')\n").unwrap();
        fs::write(install_dir.join("VERSION"), "0.2.0\n").unwrap();

        let supervisor = FakeSupervisor::new();
        let orchestrator = UpdateOrchestrator::new(
            PackageStore::new(dir.path().join("staging")),
            BackupManager::new(&backup_dir, &install_dir),
            // Nothing listens on the discard port
            RemoteVersionSource::new("http://127.0.0.1:9/api/v1", Duration::from_secs(2)).unwrap(),
            supervisor.clone(),
            HistoryLog::new(dir.path().join("history.log")),
            install_dir.join("VERSION"),
        );

        Fixture {
            dir,
            install_dir,
            backup_dir,
            supervisor,
            orchestrator,
        }
    }

    #[test]
    fn test_controller_backup_pauses_nothing_by_default() {
        let orchestrator = UpdateOrchestrator::from_config(&ArmnasConfig::default()).unwrap();
        assert!(orchestrator.backups().paused_services().is_empty());

        let mut config = ArmnasConfig::default();
        config.backup.controller_pause_services = vec!["armnas-backend".to_string(), "nginx".to_string()];
        let orchestrator = UpdateOrchestrator::from_config(&config).unwrap();
        assert_eq!(orchestrator.backups().paused_services(), ["nginx".to_string()]);
    }

    #[tokio::test]
    async fn test_install_backs_up_then_launches() {
        let fx = fixture();
        fx.orchestrator
            .store()
            .store_bytes("armnas_0.2.1.run", b"#!/bin/sh\nexit 0\n")
            .await
            .unwrap();

        let receipt = fx.orchestrator.install("armnas_0.2.1.run").await.unwrap();
        assert!(receipt.success);
        assert!(receipt.warning.contains("connection may drop"));

        let status = fx.orchestrator.status();
        assert_eq!(status.phase, UpdatePhase::Installing);
        let backup = status.backup.unwrap();
        assert!(backup.starts_with("backup_pre_update_0.2.0_"));
        assert!(fx.backup_dir.join(&backup).exists());

        let launched = fx.supervisor.launched.lock();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].backup.as_deref(), Some(backup.as_str()));
    }

    #[tokio::test]
    async fn test_second_install_conflicts() {
        let fx = fixture();
        fx.orchestrator.store().store_bytes("a.run", b"a").await.unwrap();
        fx.orchestrator.install("a.run").await.unwrap();

        let err = fx.orchestrator.install("a.run").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(fx.supervisor.launched.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_tampered_package_never_reaches_backup() {
        let fx = fixture();
        let pkg = fx
            .orchestrator
            .store()
            .store_bytes("a.run", b"genuine")
            .await
            .unwrap();
        fs::write(&pkg.path, b"tampered").unwrap();

        let err = fx.orchestrator.install("a.run").await.unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(fx.orchestrator.status().phase, UpdatePhase::Failed);
        assert!(!fx.backup_dir.exists());
        assert!(fx.supervisor.launched.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bad_name_leaves_phase_alone() {
        let fx = fixture();
        assert!(fx.orchestrator.install("../../etc/passwd").await.is_err());
        assert_eq!(fx.orchestrator.status().phase, UpdatePhase::Idle);
    }

    #[tokio::test]
    async fn test_refresh_completes_and_rereads_version() {
        let fx = fixture();
        fx.orchestrator.store().store_bytes("a.run", b"a").await.unwrap();
        fx.orchestrator.install("a.run").await.unwrap();

        assert_eq!(fx.orchestrator.refresh().await.unwrap().phase, UpdatePhase::Installing);

        fs::write(fx.install_dir.join("VERSION"), "0.2.1\n").unwrap();
        *fx.supervisor.state.lock() = InstallState::Succeeded;
        let status = fx.orchestrator.refresh().await.unwrap();
        assert_eq!(status.phase, UpdatePhase::Completed);
        assert_eq!(status.current_version, "0.2.1");

        // A new cycle may start from Completed
        fx.orchestrator.store().store_bytes("b.run", b"b").await.unwrap();
        fx.orchestrator.install("b.run").await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_failed_install() {
        let fx = fixture();
        fx.orchestrator.store().store_bytes("a.run", b"a").await.unwrap();
        fx.orchestrator.install("a.run").await.unwrap();

        *fx.supervisor.state.lock() = InstallState::Failed;
        let status = fx.orchestrator.refresh().await.unwrap();
        assert_eq!(status.phase, UpdatePhase::Failed);
        assert_eq!(status.current_version, "0.2.0");
        assert!(status.message.unwrap().contains("status 2"));
    }

    #[tokio::test]
    async fn test_refresh_lost_install_uses_history() {
        let fx = fixture();
        fx.orchestrator.store().store_bytes("a.run", b"a").await.unwrap();
        fx.orchestrator.install("a.run").await.unwrap();

        let history = HistoryLog::new(fx.dir.path().join("history.log"));
        history
            .append(&UpdateRecord::now("a.run", UpdateStatus::Success, None))
            .unwrap();
        fs::write(fx.install_dir.join("VERSION"), "0.2.1\n").unwrap();

        *fx.supervisor.state.lock() = InstallState::Lost;
        let status = fx.orchestrator.refresh().await.unwrap();
        assert_eq!(status.phase, UpdatePhase::Completed);
        assert_eq!(status.current_version, "0.2.1");
    }

    #[tokio::test]
    async fn test_refresh_lost_install_without_history_fails() {
        let fx = fixture();
        fx.orchestrator.store().store_bytes("a.run", b"a").await.unwrap();
        fx.orchestrator.install("a.run").await.unwrap();

        // An older attempt of the same package does not count
        let history = HistoryLog::new(fx.dir.path().join("history.log"));
        history
            .append(&UpdateRecord {
                date: "2020-01-01 00:00:00".to_string(),
                filename: "a.run".to_string(),
                status: UpdateStatus::Success,
                error_code: None,
            })
            .unwrap();

        *fx.supervisor.state.lock() = InstallState::Lost;
        let status = fx.orchestrator.refresh().await.unwrap();
        assert_eq!(status.phase, UpdatePhase::Failed);
        assert!(status.message.unwrap().contains("without reporting"));

        // No longer stuck: a new install may start
        fx.orchestrator.install("a.run").await.unwrap();
    }

    #[tokio::test]
    async fn test_check_with_unreachable_registry() {
        let fx = fixture();
        let result = fx.orchestrator.check_updates(None).await.unwrap();
        assert!(!result.update_available);
        assert_eq!(result.current_version, "0.2.0");
        assert!(result.message.unwrap().contains("unreachable"));
        assert_eq!(fx.orchestrator.status().phase, UpdatePhase::Idle);
    }

    #[tokio::test]
    async fn test_download_bad_url_fails() {
        let fx = fixture();
        let err = fx
            .orchestrator
            .download("ftp://example.com/a.run", "a.run", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
        assert_eq!(fx.orchestrator.status().phase, UpdatePhase::Failed);
    }

    #[test]
    fn test_check_result_requires_newer_version() {
        let info = |v: &str| UpdateInfo {
            version: v.to_string(),
            download_url: "http://x/a.run".to_string(),
            sha256: None,
            changelog: vec![],
            critical: false,
            size: None,
            release_date: None,
        };

        assert!(CheckResult::from_outcome("0.2.0", CheckOutcome::Available(info("0.2.1"))).update_available);
        assert!(!CheckResult::from_outcome("0.2.1", CheckOutcome::Available(info("0.2.1"))).update_available);
        assert!(!CheckResult::from_outcome("0.10.0", CheckOutcome::Available(info("0.9.9"))).update_available);
        assert!(!CheckResult::from_outcome("0.2.0", CheckOutcome::UpToDate).update_available);
    }

    #[test]
    fn test_package_name_for() {
        assert_eq!(package_name_for("http://x/files/armnas_0.2.1.run", "0.2.1"), "armnas_0.2.1.run");
        assert_eq!(package_name_for("http://x/download?id=3", "0.2.1"), "armnas_0.2.1.run");
        assert_eq!(package_name_for("not a url", "1.0"), "armnas_1.0.run");
    }
}
