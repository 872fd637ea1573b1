// src/backup/mod.rs

//! Point-in-time archives of the installation directory
//!
//! Backups are gzip-compressed tarballs named
//! `backup_<reason>_<version>_<timestamp>.tar.gz` (or `backup_<timestamp>.tar.gz`
//! for manual backups). Entries are stored relative to the install
//! directory's parent, so `/opt/armnas/backend/main.py` is archived as
//! `armnas/backend/main.py` and a restore is `tar -xzf ... -C /opt`.
//!
//! # Guarantees
//!
//! - An archive is written under a hidden temp name and renamed only after
//!   the gzip stream is finished; a failed backup leaves nothing behind.
//! - The backup directory is never archived into itself.
//! - Services configured for pausing are stopped for the duration of the
//!   archive and restarted on every exit path.
//! - Rotation removes the oldest backups by modification time and never
//!   aborts because one file could not be removed.

use crate::error::{Error, Result};
use crate::filesystem::path::{join_in, validate_backup_filename, BACKUP_PREFIX, BACKUP_SUFFIX};
use crate::system::{PausedServices, ServiceController};
use chrono::{DateTime, Local, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Timestamp format embedded in backup names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A backup archive on disk
#[derive(Debug, Clone, Serialize)]
pub struct BackupRecord {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub size_mb: f64,
    pub created: DateTime<Utc>,
}

impl BackupRecord {
    fn from_path(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = metadata.len();
        let created: DateTime<Utc> = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH).into();

        Ok(Self {
            filename,
            path: path.to_path_buf(),
            size,
            size_mb: bytes_to_mb(size),
            created,
        })
    }
}

/// Manual restore instructions for a backup
#[derive(Debug, Clone, Serialize)]
pub struct RestorePlan {
    pub filename: String,
    pub backup_path: PathBuf,
    pub command: String,
    pub note: String,
}

pub(crate) fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

/// Creates, lists, rotates and deletes installation backups
#[derive(Clone)]
pub struct BackupManager {
    backup_dir: PathBuf,
    install_dir: PathBuf,
    exclude: Vec<glob::Pattern>,
    services: Option<(ServiceController, Vec<String>)>,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            install_dir: install_dir.into(),
            exclude: Vec::new(),
            services: None,
        }
    }

    /// Glob patterns to leave out of archives
    ///
    /// Patterns containing `/` match the path relative to the install
    /// directory; bare patterns match any single path component.
    pub fn with_excludes(mut self, patterns: &[String]) -> Result<Self> {
        self.exclude = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| Error::ConfigError(format!("Bad exclude pattern '{}': {}", p, e)))
            })
            .collect::<Result<_>>()?;
        Ok(self)
    }

    /// Services to stop while an archive is written
    pub fn with_paused_services(mut self, controller: ServiceController, services: Vec<String>) -> Self {
        self.services = Some((controller, services));
        self
    }

    /// Services stopped around each archive
    pub fn paused_services(&self) -> &[String] {
        self.services
            .as_ref()
            .map(|(_, services)| services.as_slice())
            .unwrap_or(&[])
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Build a backup filename
    pub fn backup_name(reason: Option<&str>, version: Option<&str>, at: DateTime<Local>) -> String {
        let ts = at.format(TIMESTAMP_FORMAT);
        match (reason, version) {
            (Some(r), Some(v)) => format!("{}{}_{}_{}{}", BACKUP_PREFIX, r, v, ts, BACKUP_SUFFIX),
            (Some(r), None) => format!("{}{}_{}{}", BACKUP_PREFIX, r, ts, BACKUP_SUFFIX),
            _ => format!("{}{}{}", BACKUP_PREFIX, ts, BACKUP_SUFFIX),
        }
    }

    fn pause(&self) -> Option<PausedServices> {
        self.services
            .as_ref()
            .map(|(controller, services)| controller.pause(services))
    }

    fn is_excluded(&self, rel: &Path) -> bool {
        if let Ok(inside) = self.backup_dir.strip_prefix(&self.install_dir)
            && !inside.as_os_str().is_empty()
            && rel.starts_with(inside)
        {
            return true;
        }

        let rel_str = rel.to_string_lossy();
        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();

        self.exclude.iter().any(|pattern| {
            if pattern.as_str().contains('/') {
                pattern.matches(&rel_str)
            } else {
                pattern.matches(&name)
            }
        })
    }

    /// Archive the installation directory
    ///
    /// `reason`/`version` end up in the filename, e.g. `pre_update` and the
    /// currently installed version.
    pub fn create_backup(&self, reason: Option<&str>, version: Option<&str>) -> Result<BackupRecord> {
        if !self.install_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Installation directory {}",
                self.install_dir.display()
            )));
        }

        let base = Self::backup_name(reason, version, Local::now());
        let mut filename = base.clone();
        let mut counter = 1;
        while self.backup_dir.join(&filename).exists() {
            filename = format!("{}_{}{}", base.trim_end_matches(BACKUP_SUFFIX), counter, BACKUP_SUFFIX);
            counter += 1;
        }
        let final_path = self.backup_dir.join(&filename);

        info!("Creating backup {} of {}", filename, self.install_dir.display());

        let _paused = self.pause();
        fs::create_dir_all(&self.backup_dir)?;

        let mut temp = tempfile::Builder::new()
            .prefix(".backup_")
            .suffix(".partial")
            .tempfile_in(&self.backup_dir)?;

        let entries = self.write_archive(temp.as_file_mut())?;
        temp.as_file().sync_all()?;
        temp.persist(&final_path).map_err(|e| Error::Io(e.error))?;

        let record = BackupRecord::from_path(&final_path)?;
        info!(
            "Backup complete: {} ({} entries, {:.2} MB)",
            record.filename, entries, record.size_mb
        );
        Ok(record)
    }

    fn write_archive(&self, out: &mut fs::File) -> Result<usize> {
        let root_name = self
            .install_dir
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("install"));

        let encoder = GzEncoder::new(out, Compression::default());
        let mut archive = tar::Builder::new(encoder);
        archive.follow_symlinks(false);

        let mut count = 0;
        let install_dir = self.install_dir.clone();
        let walker = WalkDir::new(&self.install_dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(&install_dir) {
                Ok(rel) if rel.as_os_str().is_empty() => true,
                Ok(rel) => !self.is_excluded(rel),
                Err(_) => false,
            });

        for entry in walker {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(&self.install_dir)
                .map_err(|e| Error::IoError(e.to_string()))?;
            let name = if rel.as_os_str().is_empty() {
                root_name.clone()
            } else {
                root_name.join(rel)
            };

            if entry.file_type().is_dir() {
                archive.append_dir(&name, entry.path())?;
            } else {
                archive.append_path_with_name(entry.path(), &name)?;
            }
            count += 1;
        }

        let encoder = archive.into_inner()?;
        encoder.finish()?;
        Ok(count)
    }

    /// All backups, newest first
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(BACKUP_PREFIX) || !name.ends_with(BACKUP_SUFFIX) {
                continue;
            }
            if !entry.file_type()?.is_file() {
                continue;
            }
            match BackupRecord::from_path(&entry.path()) {
                Ok(record) => records.push(record),
                Err(e) => debug!("Skipping {}: {}", name, e),
            }
        }

        records.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.filename.cmp(&a.filename)));
        Ok(records)
    }

    /// Path of a validated backup name
    pub fn path_for(&self, filename: &str) -> Result<PathBuf> {
        let filename = validate_backup_filename(filename)?;
        join_in(&self.backup_dir, &filename)
    }

    /// Delete one backup
    pub fn delete(&self, filename: &str) -> Result<()> {
        let path = self.path_for(filename)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted backup {}", filename);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Backup {}", filename)))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Keep the `max` most recently modified backups, delete the rest
    ///
    /// Returns the names of the removed backups.
    pub fn rotate(&self, max: usize) -> Result<Vec<String>> {
        let pattern = self
            .backup_dir
            .join(format!("{}*{}", BACKUP_PREFIX, BACKUP_SUFFIX));
        let pattern = pattern.to_string_lossy();

        let mut backups: Vec<(PathBuf, SystemTime)> = glob::glob(&pattern)
            .map_err(|e| Error::ParseError(format!("Bad backup glob: {}", e)))?
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                let modified = fs::metadata(&path).ok()?.modified().ok()?;
                Some((path, modified))
            })
            .collect();

        if backups.len() <= max {
            debug!("{} backups present, limit {}, nothing to rotate", backups.len(), max);
            return Ok(Vec::new());
        }

        // Newest first
        backups.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = Vec::new();
        for (path, _) in backups.into_iter().skip(max) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    info!("Rotated out old backup {}", name);
                    removed.push(name);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Old backup {} already gone", path.display());
                }
                Err(e) => warn!("Failed to remove old backup {}: {}", path.display(), e),
            }
        }

        Ok(removed)
    }

    /// Manual restore command for a backup
    ///
    /// Restoring root-owned state is never automated; the caller receives the
    /// command to run.
    pub fn restore_command(&self, filename: &str) -> Result<RestorePlan> {
        let path = self.path_for(filename)?;
        if !path.is_file() {
            return Err(Error::NotFound(format!("Backup {}", filename)));
        }

        let target = self
            .install_dir
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .to_path_buf();

        Ok(RestorePlan {
            filename: filename.to_string(),
            command: format!("sudo tar -xzf {} -C {}", path.display(), target.display()),
            backup_path: path,
            note: "Restore requires root. Stop the armnas services before extracting, then start them again."
                .to_string(),
        })
    }
}
