// src/installer/steps.rs

//! The individual installer steps
//!
//! Each step returns `Done` with a short summary, `Skipped` with the reason,
//! or an error that stops the run.

use super::{Installer, PackageMetadata, RunState, Step, StepOutcome, METADATA_FILE};
use crate::error::{Error, Result};
use crate::filesystem::{copy_tree, move_path, set_mode};
use crate::system::CommandSpec;
use crate::version::read_version_file;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BACKEND_DIR: &str = "backend";
const FRONTEND_DIR: &str = "frontend";
const REQUIREMENTS_FILE: &str = "requirements.txt";
const PREVIOUS_FRONTEND: &str = ".frontend_previous";

fn step_failed(step: Step, reason: impl Into<String>) -> Error {
    Error::InstallFailed {
        step: step.as_str().to_string(),
        reason: reason.into(),
    }
}

/// Payload files matching a glob pattern, sorted by name
fn payload_matches(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = dir.join(pattern);
    let paths = glob::glob(&full.to_string_lossy())
        .map_err(|e| Error::InvalidPath(format!("{}: {}", pattern, e)))?;

    let mut found = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| Error::IoError(e.to_string()))?;
        if path.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidPath(path.display().to_string()))
}

impl Installer {
    pub(super) fn check_privileges(&self) -> Result<StepOutcome> {
        if !self.options.require_root {
            return Ok(StepOutcome::Skipped("root not required".to_string()));
        }
        if !nix::unistd::geteuid().is_root() {
            return Err(step_failed(Step::CheckPrivileges, "must run as root"));
        }
        Ok(StepOutcome::Done("running as root".to_string()))
    }

    pub(super) fn check_installation(&self) -> Result<StepOutcome> {
        if !self.options.payload_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Payload directory {}",
                self.options.payload_dir.display()
            )));
        }
        if !self.options.install_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Installation directory {}",
                self.options.install_dir.display()
            )));
        }
        Ok(StepOutcome::Done(format!(
            "installed version {}",
            read_version_file(&self.options.version_file)
        )))
    }

    pub(super) fn load_metadata(&self, state: &mut RunState) -> Result<StepOutcome> {
        let path = self.options.payload_dir.join(METADATA_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StepOutcome::Skipped(format!("no {}", METADATA_FILE)));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let metadata: PackageMetadata = serde_json::from_str(&content)
            .map_err(|e| Error::ParseError(format!("{}: {}", METADATA_FILE, e)))?;

        let summary = match metadata.version {
            Some(ref v) if metadata.critical => format!("version {} (critical)", v),
            Some(ref v) => format!("version {}", v),
            None => "no version given".to_string(),
        };
        for line in metadata.changelog() {
            debug!("changelog: {}", line);
        }
        state.metadata = Some(metadata);
        Ok(StepOutcome::Done(summary))
    }

    pub(super) fn confirm(&self, state: &RunState) -> Result<StepOutcome> {
        if self.options.auto {
            return Ok(StepOutcome::Skipped("--auto".to_string()));
        }

        let question = format!(
            "Install {} {}into {}?",
            self.options.package,
            state.version().map(|v| format!("(version {}) ", v)).unwrap_or_default(),
            self.options.install_dir.display()
        );
        if (self.prompt)(&question) {
            Ok(StepOutcome::Done("confirmed".to_string()))
        } else {
            Err(step_failed(Step::Confirm, "declined by operator"))
        }
    }

    pub(super) fn create_backup(&self, state: &mut RunState) -> Result<StepOutcome> {
        if let Some(ref name) = self.options.backup_taken {
            match self.backups.path_for(name) {
                Ok(path) if path.is_file() => {
                    return Ok(StepOutcome::Skipped(format!("backup {} already taken", name)));
                }
                _ => state.warn(format!("Announced backup {} not found, creating a new one", name)),
            }
        }

        let installed = read_version_file(&self.options.version_file);
        let record = self.backups.create_backup(Some("pre_update"), Some(&installed))?;

        match self.backups.rotate(self.options.max_backups) {
            Ok(removed) if !removed.is_empty() => info!("Rotated out {} old backup(s)", removed.len()),
            Ok(_) => {}
            Err(e) => state.warn(format!("Backup rotation failed: {}", e)),
        }
        Ok(StepOutcome::Done(record.filename))
    }

    pub(super) fn replace_backend(&self) -> Result<StepOutcome> {
        let src = self.options.payload_dir.join(BACKEND_DIR);
        if !src.is_dir() {
            return Ok(StepOutcome::Skipped("no backend in payload".to_string()));
        }
        let dst = self.options.install_dir.join(BACKEND_DIR);

        // Preserved paths are relative to the install dir; the overlay walks
        // the backend tree.
        let keep: Vec<PathBuf> = self
            .options
            .preserve
            .iter()
            .filter_map(|p| Path::new(p).strip_prefix(BACKEND_DIR).ok())
            .map(Path::to_path_buf)
            .collect();

        let copied = copy_tree(&src, &dst, |rel| keep.iter().any(|k| k == rel))?;
        let kept: Vec<_> = keep
            .iter()
            .filter(|k| dst.join(k).symlink_metadata().is_ok())
            .map(|k| k.display().to_string())
            .collect();

        Ok(StepOutcome::Done(if kept.is_empty() {
            format!("{} files updated", copied)
        } else {
            format!("{} files updated, kept {}", copied, kept.join(", "))
        }))
    }

    pub(super) fn install_dependencies(&self, state: &mut RunState) -> Result<StepOutcome> {
        let backend = self.options.install_dir.join(BACKEND_DIR);
        let requirements = backend.join(REQUIREMENTS_FILE);
        if !requirements.is_file() {
            return Ok(StepOutcome::Skipped(format!("no {}", REQUIREMENTS_FILE)));
        }

        let pip = backend.join("venv/bin/pip");
        if !pip.exists() {
            state.warn(format!("No virtualenv at {}, dependencies not updated", backend.join("venv").display()));
            return Ok(StepOutcome::Skipped("no virtualenv".to_string()));
        }
        let pip = pip.to_string_lossy().into_owned();

        let runs = [
            CommandSpec::new(&pip).args(["install", "--upgrade", "pip"]),
            CommandSpec::new(&pip)
                .args(["install", "-r"])
                .arg(requirements.to_string_lossy())
                .current_dir(&backend),
        ];

        let mut failures = 0;
        for spec in &runs {
            let result = self
                .executor
                .run(spec)
                .and_then(|out| out.into_result(&spec.display()));
            if let Err(e) = result {
                failures += 1;
                state.warn(format!("Dependency update problem: {}", e));
            }
        }

        Ok(StepOutcome::Done(if failures == 0 {
            "dependencies up to date".to_string()
        } else {
            format!("completed with {} warning(s)", failures)
        }))
    }

    pub(super) fn update_scripts(&self) -> Result<StepOutcome> {
        let payload = &self.options.payload_dir;
        let install = &self.options.install_dir;

        let scripts = payload_matches(payload, "*.sh")?;
        for script in &scripts {
            let target = install.join(file_name(script)?);
            fs::copy(script, &target)?;
            set_mode(&target, 0o755)?;
        }

        let configs = payload_matches(payload, "*.conf")?;
        for conf in &configs {
            let name = file_name(conf)?;
            let target = install.join(name);
            if target.is_file() {
                fs::copy(&target, install.join(format!("{}.bak", name)))?;
            }
            fs::copy(conf, &target)?;
        }

        let compose = payload_matches(payload, "docker-compose*.yml")?;
        for file in &compose {
            fs::copy(file, install.join(file_name(file)?))?;
        }

        if scripts.is_empty() && configs.is_empty() && compose.is_empty() {
            return Ok(StepOutcome::Skipped("nothing to update".to_string()));
        }
        Ok(StepOutcome::Done(format!(
            "{} script(s), {} config(s), {} compose file(s)",
            scripts.len(),
            configs.len(),
            compose.len()
        )))
    }

    pub(super) fn rebuild_frontend(&self, state: &mut RunState) -> Result<StepOutcome> {
        let src = self.options.payload_dir.join(FRONTEND_DIR);
        if !src.is_dir() {
            return Ok(StepOutcome::Skipped("no frontend in payload".to_string()));
        }
        let dst = self.options.install_dir.join(FRONTEND_DIR);
        let previous = self.options.install_dir.join(PREVIOUS_FRONTEND);

        if previous.exists() {
            fs::remove_dir_all(&previous)?;
        }
        let had_previous = dst.is_dir();
        if had_previous {
            move_path(&dst, &previous)?;
        }

        let result = copy_tree(&src, &dst, |_| false).and_then(|_| self.build_frontend(&dst, state));

        match result {
            Ok(summary) => {
                if had_previous {
                    fs::remove_dir_all(&previous)?;
                }
                Ok(StepOutcome::Done(summary))
            }
            Err(e) => {
                if had_previous {
                    if dst.exists() {
                        fs::remove_dir_all(&dst)?;
                    }
                    move_path(&previous, &dst)?;
                    info!("Restored previous frontend");
                }
                Err(e)
            }
        }
    }

    /// npm install + build in `dir`, accepting a shipped `dist/` when npm fails
    fn build_frontend(&self, dir: &Path, state: &mut RunState) -> Result<String> {
        let dist = dir.join("dist");

        let Some(npm) = (self.find_tool)("npm") else {
            state.warn("npm not available, frontend not rebuilt");
            return if dist.is_dir() {
                Ok("using prebuilt dist".to_string())
            } else {
                Err(Error::ToolNotFound("npm (and no prebuilt frontend dist)".to_string()))
            };
        };
        let npm = npm.to_string_lossy().into_owned();

        let install = CommandSpec::new(&npm)
            .args(["install", "--production=false"])
            .current_dir(dir);
        if let Err(e) = self
            .executor
            .run(&install)
            .and_then(|out| out.into_result("npm install"))
        {
            state.warn(format!("Frontend dependency install problem: {}", e));
        }

        let build = CommandSpec::new(&npm).args(["run", "build"]).current_dir(dir);
        match self
            .executor
            .run(&build)
            .and_then(|out| out.into_result("npm run build"))
        {
            Ok(_) => Ok("frontend rebuilt".to_string()),
            Err(e) if dist.is_dir() => {
                state.warn(format!("{}; using prebuilt dist", e));
                Ok("using prebuilt dist".to_string())
            }
            Err(e) => Err(e),
        }
    }

    pub(super) fn write_version(&self, state: &RunState) -> Result<StepOutcome> {
        let Some(version) = state.version() else {
            return Ok(StepOutcome::Skipped("no version in metadata".to_string()));
        };

        let path = &self.options.version_file;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", version))?;
        Ok(StepOutcome::Done(format!("version {}", version)))
    }

    pub(super) fn restart_services(&self, state: &mut RunState) -> Result<StepOutcome> {
        if self.options.services.is_empty() {
            return Ok(StepOutcome::Skipped("no services configured".to_string()));
        }

        if self.options.services.iter().any(|s| s == "nginx")
            && let Some(nginx) = (self.find_tool)("nginx")
        {
            let check = CommandSpec::new(nginx.to_string_lossy()).arg("-t");
            if let Err(e) = self
                .executor
                .run(&check)
                .and_then(|out| out.into_result("nginx -t"))
            {
                state.warn(format!("nginx configuration check failed: {}", e));
            }
        }

        let failed = self.services.restart_all(&self.options.services);
        if failed.is_empty() {
            Ok(StepOutcome::Done(format!("restarted {}", self.options.services.join(", "))))
        } else {
            Err(Error::CommandFailed(format!("failed to restart {}", failed.join(", "))))
        }
    }
}
