// src/installer/mod.rs

//! Installer engine for update payloads
//!
//! An update package unpacks to a payload directory and runs
//! `armnas apply --payload <dir> [--auto]`. The engine walks a fixed list
//! of steps:
//!
//! ```text
//!  1 check_privileges      ─┐
//!  2 check_installation     │  failure: installation untouched, exit 1
//!  3 load_metadata          │
//!  4 confirm                │
//!  5 create_backup         ─┘
//!  ─────────── point of no return ───────────
//!  6 replace_backend       ─┐
//!  7 install_dependencies   │  failure: remaining steps skipped,
//!  8 update_scripts         │  services still restarted, exit 2
//!  9 rebuild_frontend       │
//! 10 write_version         ─┘
//! 11 restart_services         runs whenever step 6 was reached
//! ```
//!
//! Services are left running while files are replaced and restarted at the
//! end. Every run appends one line to the history log, naming the failed
//! step on failure. The install lock keeps two runs from interleaving.

mod steps;

use crate::backup::BackupManager;
use crate::config::ArmnasConfig;
use crate::error::{Error, Result};
use crate::history::{HistoryLog, UpdateRecord, UpdateStatus};
use crate::lock::ProcessLock;
use crate::remote::Changelog;
use crate::supervisor::BACKUP_TAKEN_ENV;
use crate::system::{CommandExecutor, ServiceController, SystemExecutor};
use serde::Deserialize;
use std::fmt;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Every step succeeded
pub const EXIT_SUCCESS: i32 = 0;
/// Failed before anything was changed
pub const EXIT_FAILED_SAFE: i32 = 1;
/// Failed after the installation was modified
pub const EXIT_FAILED_PARTIAL: i32 = 2;

/// Payload file describing the update
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CheckPrivileges,
    CheckInstallation,
    LoadMetadata,
    Confirm,
    CreateBackup,
    ReplaceBackend,
    InstallDependencies,
    UpdateScripts,
    RebuildFrontend,
    WriteVersion,
    RestartServices,
}

impl Step {
    pub const ALL: [Step; 11] = [
        Step::CheckPrivileges,
        Step::CheckInstallation,
        Step::LoadMetadata,
        Step::Confirm,
        Step::CreateBackup,
        Step::ReplaceBackend,
        Step::InstallDependencies,
        Step::UpdateScripts,
        Step::RebuildFrontend,
        Step::WriteVersion,
        Step::RestartServices,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckPrivileges => "check_privileges",
            Self::CheckInstallation => "check_installation",
            Self::LoadMetadata => "load_metadata",
            Self::Confirm => "confirm",
            Self::CreateBackup => "create_backup",
            Self::ReplaceBackend => "replace_backend",
            Self::InstallDependencies => "install_dependencies",
            Self::UpdateScripts => "update_scripts",
            Self::RebuildFrontend => "rebuild_frontend",
            Self::WriteVersion => "write_version",
            Self::RestartServices => "restart_services",
        }
    }

    /// Steps at or after this one modify the installation
    pub fn modifies_installation(&self) -> bool {
        !matches!(
            self,
            Self::CheckPrivileges
                | Self::CheckInstallation
                | Self::LoadMetadata
                | Self::Confirm
                | Self::CreateBackup
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `metadata.json` at the payload root
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageMetadata {
    pub version: Option<String>,
    pub timestamp: Option<String>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    changelog: Option<Changelog>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl PackageMetadata {
    pub fn changelog(&self) -> Vec<String> {
        self.changelog.clone().map(Changelog::into_lines).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done(String),
    Skipped(String),
}

/// What happened to one step
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: Step,
    pub outcome: std::result::Result<StepOutcome, String>,
}

/// Result of an installer run
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub package: String,
    pub exit_code: i32,
    pub failed_step: Option<Step>,
    pub error: Option<String>,
    pub steps: Vec<StepReport>,
    pub warnings: Vec<String>,
}

impl InstallReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == EXIT_SUCCESS
    }
}

/// Everything the engine needs to know about this run
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub payload_dir: PathBuf,
    /// Name recorded in history, normally the `.run` file
    pub package: String,
    pub install_dir: PathBuf,
    pub version_file: PathBuf,
    pub lock_path: PathBuf,
    /// Skip the confirmation prompt
    pub auto: bool,
    pub require_root: bool,
    /// Backup already taken by the controller for this run
    pub backup_taken: Option<String>,
    pub max_backups: usize,
    pub services: Vec<String>,
    /// Paths relative to the install dir carried across the replacement
    pub preserve: Vec<String>,
}

impl InstallOptions {
    pub fn from_config(config: &ArmnasConfig, payload_dir: &Path, auto: bool) -> Self {
        let package = payload_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload".to_string());

        Self {
            payload_dir: payload_dir.to_path_buf(),
            package,
            install_dir: config.paths.install_dir.clone(),
            version_file: config.paths.version_file(),
            lock_path: config.paths.install_lock.clone(),
            auto,
            require_root: true,
            backup_taken: std::env::var(BACKUP_TAKEN_ENV).ok().filter(|v| !v.is_empty()),
            max_backups: config.backup.max_backups,
            services: config.install.services.clone(),
            preserve: config.install.preserve.clone(),
        }
    }
}

type Prompt = Box<dyn Fn(&str) -> bool + Send + Sync>;
type ToolLookup = Box<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>;

/// Mutable state threaded through the steps
#[derive(Default)]
struct RunState {
    metadata: Option<PackageMetadata>,
    warnings: Vec<String>,
}

impl RunState {
    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn version(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.version.as_deref())
    }
}

pub struct Installer {
    options: InstallOptions,
    executor: Arc<dyn CommandExecutor>,
    services: ServiceController,
    backups: BackupManager,
    history: HistoryLog,
    prompt: Prompt,
    find_tool: ToolLookup,
}

impl Installer {
    pub fn new(
        options: InstallOptions,
        executor: Arc<dyn CommandExecutor>,
        backups: BackupManager,
        history: HistoryLog,
    ) -> Self {
        Self {
            options,
            services: ServiceController::new(executor.clone()),
            executor,
            backups,
            history,
            prompt: Box::new(ask_stdin),
            find_tool: Box::new(|name| which::which(name).ok()),
        }
    }

    pub fn from_config(config: &ArmnasConfig, payload_dir: &Path, auto: bool) -> anyhow::Result<Self> {
        let executor: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor::new(config.command_timeout()?));
        let backups = BackupManager::new(&config.paths.backup_dir, &config.paths.install_dir)
            .with_excludes(&config.backup.exclude)?
            .with_paused_services(
                ServiceController::new(executor.clone()),
                config.backup.pause_services.clone(),
            );

        Ok(Self::new(
            InstallOptions::from_config(config, payload_dir, auto),
            executor,
            backups,
            HistoryLog::new(&config.paths.history_file),
        ))
    }

    /// Replace the interactive yes/no question
    pub fn with_prompt(mut self, prompt: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    /// Name recorded in history instead of the payload directory name
    pub fn with_package_name(mut self, name: impl Into<String>) -> Self {
        self.options.package = name.into();
        self
    }

    /// Replace the `PATH` lookup for external tools
    pub fn with_tool_lookup(mut self, lookup: impl Fn(&str) -> Option<PathBuf> + Send + Sync + 'static) -> Self {
        self.find_tool = Box::new(lookup);
        self
    }

    pub fn options(&self) -> &InstallOptions {
        &self.options
    }

    /// Run every step and record the outcome in history
    pub fn run(&self) -> InstallReport {
        info!(
            "Installing {} from {} into {}",
            self.options.package,
            self.options.payload_dir.display(),
            self.options.install_dir.display()
        );

        let report = match ProcessLock::try_acquire(&self.options.lock_path, "install") {
            Ok(_lock) => self.run_steps(),
            Err(e) => {
                error!("{}", e);
                InstallReport {
                    package: self.options.package.clone(),
                    exit_code: EXIT_FAILED_SAFE,
                    failed_step: None,
                    error: Some(e.to_string()),
                    steps: Vec::new(),
                    warnings: Vec::new(),
                }
            }
        };

        let record = match report.failed_step {
            None if report.succeeded() => UpdateRecord::now(&report.package, UpdateStatus::Success, None),
            Some(step) => UpdateRecord::now(&report.package, UpdateStatus::Failure, Some(step.as_str())),
            None => UpdateRecord::now(&report.package, UpdateStatus::Failure, Some("lock")),
        };
        if let Err(e) = self.history.append(&record) {
            warn!("Could not record install history: {}", e);
        }

        match report.exit_code {
            EXIT_SUCCESS => info!("Update {} installed", report.package),
            EXIT_FAILED_SAFE => error!("Update {} failed; installation unchanged", report.package),
            _ => error!(
                "Update {} failed after modifying the installation; restore from backup if needed",
                report.package
            ),
        }
        report
    }

    fn run_steps(&self) -> InstallReport {
        let mut state = RunState::default();
        let mut reports = Vec::new();
        let mut failure: Option<(Step, Error)> = None;
        let mut modified = false;

        for step in Step::ALL {
            let outcome = match (&failure, step) {
                (None, _) => {
                    modified |= step.modifies_installation();
                    self.run_step(step, &mut state)
                }
                (Some(_), Step::RestartServices) if modified => self.run_step(step, &mut state),
                (Some((failed, _)), _) => Ok(StepOutcome::Skipped(format!("{} failed", failed))),
            };

            match outcome {
                Ok(StepOutcome::Done(ref msg)) => info!("[{}] {}", step, msg),
                Ok(StepOutcome::Skipped(ref why)) => info!("[{}] skipped: {}", step, why),
                Err(ref e) => error!("[{}] {}", step, e),
            }

            reports.push(StepReport {
                step,
                outcome: outcome.as_ref().cloned().map_err(|e| e.to_string()),
            });
            if let Err(e) = outcome
                && failure.is_none()
            {
                failure = Some((step, e));
            }
        }

        let (exit_code, failed_step, error) = match failure {
            None => (EXIT_SUCCESS, None, None),
            Some((step, e)) => {
                let code = if step.modifies_installation() {
                    EXIT_FAILED_PARTIAL
                } else {
                    EXIT_FAILED_SAFE
                };
                (code, Some(step), Some(e.to_string()))
            }
        };

        InstallReport {
            package: self.options.package.clone(),
            exit_code,
            failed_step,
            error,
            steps: reports,
            warnings: state.warnings,
        }
    }

    fn run_step(&self, step: Step, state: &mut RunState) -> Result<StepOutcome> {
        match step {
            Step::CheckPrivileges => self.check_privileges(),
            Step::CheckInstallation => self.check_installation(),
            Step::LoadMetadata => self.load_metadata(state),
            Step::Confirm => self.confirm(state),
            Step::CreateBackup => self.create_backup(state),
            Step::ReplaceBackend => self.replace_backend(),
            Step::InstallDependencies => self.install_dependencies(state),
            Step::UpdateScripts => self.update_scripts(),
            Step::RebuildFrontend => self.rebuild_frontend(state),
            Step::WriteVersion => self.write_version(state),
            Step::RestartServices => self.restart_services(state),
        }
    }
}

/// Ask on the terminal; anything but y/yes is "no"
fn ask_stdin(question: &str) -> bool {
    print!("{} [y/N]: ", question);
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{CommandOutput, RecordingExecutor};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        exec: RecordingExecutor,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path();

            fs::create_dir_all(root.join("armnas/backend/venv/bin")).unwrap();
            fs::write(root.join("armnas/backend/app.py"), "old").unwrap();
            fs::write(root.join("armnas/backend/config.py"), "SECRET = 'local'").unwrap();
            fs::write(root.join("armnas/backend/venv/bin/pip"), "").unwrap();
            fs::create_dir_all(root.join("armnas/frontend/dist")).unwrap();
            fs::write(root.join("armnas/frontend/dist/index.html"), "old ui").unwrap();
            fs::write(root.join("armnas/nginx.conf"), "old conf").unwrap();
            fs::write(root.join("armnas/VERSION"), "0.2.0\n").unwrap();

            fs::create_dir_all(root.join("payload/backend")).unwrap();
            fs::write(root.join("payload/backend/app.py"), "new").unwrap();
            fs::write(root.join("payload/backend/config.py"), "SECRET = 'shipped'").unwrap();
            fs::write(root.join("payload/backend/requirements.txt"), "fastapi\n").unwrap();
            fs::create_dir_all(root.join("payload/frontend/src")).unwrap();
            fs::write(root.join("payload/frontend/package.json"), "{}").unwrap();
            fs::write(root.join("payload/start.sh"), "#!/bin/sh\n").unwrap();
            fs::write(root.join("payload/nginx.conf"), "new conf").unwrap();
            fs::write(root.join("payload/docker-compose.prod.yml"), "services: {}").unwrap();
            fs::write(
                root.join("payload/metadata.json"),
                r#"{"version": "0.2.1", "critical": false, "changelog": "Faster shares"}"#,
            )
            .unwrap();

            Self {
                dir,
                exec: RecordingExecutor::new(),
            }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        fn options(&self) -> InstallOptions {
            InstallOptions {
                payload_dir: self.path("payload"),
                package: "armnas_0.2.1.run".to_string(),
                install_dir: self.path("armnas"),
                version_file: self.path("armnas/VERSION"),
                lock_path: self.path("run/install.lock"),
                auto: true,
                require_root: false,
                backup_taken: None,
                max_backups: 5,
                services: vec!["nginx".to_string(), "armnas-backend".to_string()],
                preserve: vec!["backend/venv".to_string(), "backend/config.py".to_string()],
            }
        }

        fn installer(&self, options: InstallOptions) -> Installer {
            Installer::new(
                options,
                Arc::new(self.exec.clone()),
                BackupManager::new(self.path("backups"), self.path("armnas")),
                HistoryLog::new(self.path("history.log")),
            )
            .with_tool_lookup(|name| Some(PathBuf::from(format!("/usr/bin/{}", name))))
        }

        fn history(&self) -> Vec<UpdateRecord> {
            HistoryLog::new(self.path("history.log")).read_recent(10).unwrap()
        }

        fn read(&self, rel: &str) -> String {
            fs::read_to_string(self.path(rel)).unwrap()
        }
    }

    #[test]
    fn test_step_order_and_point_of_no_return() {
        let names: Vec<_> = Step::ALL.iter().map(Step::as_str).collect();
        assert_eq!(names.first(), Some(&"check_privileges"));
        assert_eq!(names.last(), Some(&"restart_services"));

        let first_modifying = Step::ALL.iter().position(Step::modifies_installation).unwrap();
        assert_eq!(Step::ALL[first_modifying], Step::ReplaceBackend);
        assert_eq!(Step::ALL[first_modifying - 1], Step::CreateBackup);
    }

    #[test]
    fn test_full_install() {
        let fx = Fixture::new();
        let report = fx.installer(fx.options()).run();

        assert_eq!(report.exit_code, EXIT_SUCCESS, "{:?}", report.error);
        assert_eq!(fx.read("armnas/backend/app.py"), "new");
        assert_eq!(fx.read("armnas/backend/config.py"), "SECRET = 'local'");
        assert!(fx.path("armnas/backend/venv/bin/pip").exists());
        assert!(crate::filesystem::is_executable(&fx.path("armnas/start.sh")));
        assert_eq!(fx.read("armnas/nginx.conf"), "new conf");
        assert_eq!(fx.read("armnas/nginx.conf.bak"), "old conf");
        assert!(fx.path("armnas/docker-compose.prod.yml").exists());
        assert_eq!(fx.read("armnas/VERSION").trim(), "0.2.1");
        assert!(!fx.path("armnas/.frontend_previous").exists());

        let backups = BackupManager::new(fx.path("backups"), fx.path("armnas")).list().unwrap();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].filename.starts_with("backup_pre_update_0.2.0_"));

        let calls = fx.exec.calls();
        assert!(calls.iter().any(|c| c.contains("venv/bin/pip install -r")));
        assert!(calls.contains(&"/usr/bin/npm run build".to_string()));
        assert!(calls.contains(&"/usr/bin/nginx -t".to_string()));
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("systemctl restart")).count(),
            2
        );

        let history = fx.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].filename, "armnas_0.2.1.run");
        assert_eq!(history[0].status, UpdateStatus::Success);
    }

    #[test]
    fn test_declined_confirmation_changes_nothing() {
        let fx = Fixture::new();
        let mut options = fx.options();
        options.auto = false;
        let report = fx.installer(options).with_prompt(|_| false).run();

        assert_eq!(report.exit_code, EXIT_FAILED_SAFE);
        assert_eq!(report.failed_step, Some(Step::Confirm));
        assert_eq!(fx.read("armnas/backend/app.py"), "old");
        assert_eq!(fx.read("armnas/VERSION").trim(), "0.2.0");
        assert!(!fx.path("backups").exists());
        assert!(fx.exec.calls().is_empty());

        let history = fx.history();
        assert_eq!(history[0].status, UpdateStatus::Failure);
        assert_eq!(history[0].error_code.as_deref(), Some("confirm"));
    }

    #[test]
    fn test_backup_taken_by_controller_is_reused() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.path("backups")).unwrap();
        fs::write(fx.path("backups/backup_pre_update_0.2.0_20240101_000000.tar.gz"), b"x").unwrap();

        let mut options = fx.options();
        options.backup_taken = Some("backup_pre_update_0.2.0_20240101_000000.tar.gz".to_string());
        let report = fx.installer(options).run();

        assert!(report.succeeded());
        let create = report
            .steps
            .iter()
            .find(|r| r.step == Step::CreateBackup)
            .unwrap();
        assert!(matches!(create.outcome, Ok(StepOutcome::Skipped(_))));
        assert_eq!(fs::read_dir(fx.path("backups")).unwrap().count(), 1);
    }

    #[test]
    fn test_failed_frontend_build_restores_and_still_restarts() {
        let fx = Fixture::new();
        fx.exec
            .respond("/usr/bin/npm run build", CommandOutput::failed("vite: not found"));
        let report = fx.installer(fx.options()).run();

        assert_eq!(report.exit_code, EXIT_FAILED_PARTIAL);
        assert_eq!(report.failed_step, Some(Step::RebuildFrontend));
        assert_eq!(fx.read("armnas/frontend/dist/index.html"), "old ui");
        assert!(!fx.path("armnas/frontend/package.json").exists());
        // Steps after the failure are skipped, the version stays put
        assert_eq!(fx.read("armnas/VERSION").trim(), "0.2.0");

        let restarts = fx
            .exec
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("systemctl restart"))
            .count();
        assert_eq!(restarts, 2);
        assert_eq!(fx.history()[0].error_code.as_deref(), Some("rebuild_frontend"));
    }

    #[test]
    fn test_shipped_dist_used_when_build_fails() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.path("payload/frontend/dist")).unwrap();
        fs::write(fx.path("payload/frontend/dist/index.html"), "new ui").unwrap();
        fx.exec
            .respond("/usr/bin/npm run build", CommandOutput::failed("out of memory"));

        let report = fx.installer(fx.options()).run();
        assert!(report.succeeded());
        assert_eq!(fx.read("armnas/frontend/dist/index.html"), "new ui");
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn test_pip_failure_is_a_warning() {
        let fx = Fixture::new();
        let pip = fx.path("armnas/backend/venv/bin/pip").to_string_lossy().into_owned();
        fx.exec
            .respond(format!("{} install -r", pip), CommandOutput::failed("no network"));

        let report = fx.installer(fx.options()).run();
        assert!(report.succeeded());
        assert!(report.warnings.iter().any(|w| w.contains("no network")));
    }

    #[test]
    fn test_missing_installation_fails_safely() {
        let fx = Fixture::new();
        fs::remove_dir_all(fx.path("armnas")).unwrap();
        let report = fx.installer(fx.options()).run();

        assert_eq!(report.exit_code, EXIT_FAILED_SAFE);
        assert_eq!(report.failed_step, Some(Step::CheckInstallation));
        assert!(fx.exec.calls().is_empty());
    }

    #[test]
    fn test_concurrent_run_refused() {
        let fx = Fixture::new();
        let _held = ProcessLock::try_acquire(fx.path("run/install.lock"), "install").unwrap();

        let report = fx.installer(fx.options()).run();
        assert_eq!(report.exit_code, EXIT_FAILED_SAFE);
        assert!(report.steps.is_empty());
        assert_eq!(fx.read("armnas/backend/app.py"), "old");
        assert_eq!(fx.history()[0].error_code.as_deref(), Some("lock"));
    }

    #[test]
    fn test_metadata_changelog_forms() {
        let text: PackageMetadata =
            serde_json::from_str(r#"{"version": "1.0.0", "changelog": "Line one\nLine two"}"#).unwrap();
        assert_eq!(text.changelog(), vec!["Line one", "Line two"]);

        let list: PackageMetadata = serde_json::from_str(r#"{"changelog": ["a", "b"]}"#).unwrap();
        assert_eq!(list.changelog(), vec!["a", "b"]);
        assert!(list.version.is_none());
    }
}
