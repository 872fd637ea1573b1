// src/supervisor/launcher.rs

//! Detached installer launch
//!
//! The installer runs in its own session (`setsid`), so it is not part of
//! the launching process's process group and survives that process being
//! stopped or replaced. Its stdout and stderr go to
//! `install_<filename>.log` in the staging directory.
//!
//! A reaper thread waits for the child and writes `install_<filename>.exit`
//! with the exit code (128 + signal number when killed by a signal). The
//! child's pid and the launcher's pid go to `install_<filename>.pid`. If
//! the launching process goes away first the marker is never written; a
//! later process that finds the installer pid gone reports the install as
//! [`InstallState::Lost`].

use crate::error::{Error, Result};
use crate::filesystem::is_executable;
use crate::store::PackageStore;
use crate::supervisor::{InstallProgress, InstallState, LaunchReceipt, LaunchRequest};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, File};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{error, info, warn};

/// Environment variable naming a backup already taken for this install
pub const BACKUP_TAKEN_ENV: &str = "ARMNAS_BACKUP_TAKEN";

/// Flag passed to installers for unattended runs
pub const AUTO_FLAG: &str = "--auto";

/// Number of log lines included in status reports
const LOG_TAIL_LINES: usize = 20;

/// Spawns installers out of the staging directory
#[derive(Clone)]
pub struct Launcher {
    store: PackageStore,
}

impl Launcher {
    pub fn new(store: PackageStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    /// Validate and detach the installer for `request.filename`
    ///
    /// Only failures to start are reported here. Whatever happens after the
    /// child is running is visible in its log and exit marker.
    pub fn launch(&self, request: &LaunchRequest) -> Result<LaunchReceipt> {
        let path = self.store.path_for(&request.filename)?;

        let metadata = fs::symlink_metadata(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("Package {}", request.filename)),
            _ => Error::Io(e),
        })?;
        if !metadata.is_file() {
            return Err(Error::InvalidPath(format!(
                "{} is not a regular file",
                request.filename
            )));
        }
        if !is_executable(&path) {
            return Err(Error::InvalidPath(format!(
                "{} is not executable",
                request.filename
            )));
        }

        let log_path = self.store.log_path(&request.filename)?;
        let marker_path = self.store.exit_marker_path(&request.filename)?;
        let pid_path = self.store.pid_file_path(&request.filename)?;
        for stale in [&marker_path, &pid_path] {
            if let Err(e) = fs::remove_file(stale)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Could not clear stale {}: {}", stale.display(), e);
            }
        }

        let log = File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(&path);
        command
            .arg(AUTO_FLAG)
            .current_dir(self.store.staging_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(ref backup) = request.backup {
            command.env(BACKUP_TAKEN_ENV, backup);
        }

        // SAFETY: setsid is async-signal-safe and touches no parent state
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let mut child = command.spawn().map_err(|e| {
            error!("Failed to launch {}: {}", path.display(), e);
            Error::SpawnFailed(format!("{}: {}", request.filename, e))
        })?;
        let pid = child.id();
        if let Err(e) = fs::write(&pid_path, format!("{} {}\n", pid, std::process::id())) {
            warn!("Failed to write pid file {}: {}", pid_path.display(), e);
        }

        let filename = request.filename.clone();
        std::thread::Builder::new()
            .name(format!("reaper-{}", pid))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status
                        .code()
                        .or_else(|| status.signal().map(|s| 128 + s))
                        .unwrap_or(-1),
                    Err(e) => {
                        warn!("Lost track of installer {}: {}", pid, e);
                        return;
                    }
                };
                info!("Installer {} (pid {}) exited with {}", filename, pid, code);
                if let Err(e) = fs::write(&marker_path, format!("{}\n", code)) {
                    warn!("Failed to write exit marker {}: {}", marker_path.display(), e);
                }
            })
            .map_err(|e| Error::SpawnFailed(format!("reaper thread: {}", e)))?;

        info!(
            "Launched installer {} (pid {}), log {}",
            request.filename,
            pid,
            log_path.display()
        );

        Ok(LaunchReceipt::started(&request.filename, &log_path, Some(pid)))
    }

    /// What is known about an install of `filename`
    pub fn status(&self, filename: &str) -> Result<InstallProgress> {
        let log_path = self.store.log_path(filename)?;
        let marker_path = self.store.exit_marker_path(filename)?;

        if !log_path.exists() {
            return Ok(InstallProgress {
                filename: filename.to_string(),
                state: InstallState::NotStarted,
                exit_code: None,
                log_file: log_path,
                log_tail: Vec::new(),
            });
        }

        let exit_code = read_exit_marker(&marker_path);
        let state = match exit_code {
            None if is_orphaned(&self.store.pid_file_path(filename)?) => {
                warn!("Installer for {} is gone and left no exit code", filename);
                InstallState::Lost
            }
            None => InstallState::Running,
            Some(0) => InstallState::Succeeded,
            Some(_) => InstallState::Failed,
        };

        Ok(InstallProgress {
            filename: filename.to_string(),
            state,
            exit_code,
            log_tail: tail_lines(&log_path, LOG_TAIL_LINES),
            log_file: log_path,
        })
    }
}

fn read_exit_marker(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// True when another process launched the installer and it is no longer alive
///
/// A reaper in this process always writes the exit marker, so only installs
/// started by a previous process can be lost.
fn is_orphaned(pid_path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(pid_path) else {
        return false;
    };
    let mut fields = contents.split_whitespace().map(str::parse::<i32>);
    let (Some(Ok(pid)), Some(Ok(launcher))) = (fields.next(), fields.next()) else {
        return false;
    };
    if launcher as u32 == std::process::id() {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    match fs::read(path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].iter().map(|l| l.to_string()).collect()
        }
        Err(_) => Vec::new(),
    }
}
