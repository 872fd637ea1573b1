// src/filesystem/path.rs

//! Filename validation for packages and backups
//!
//! Every filename that arrives over HTTP names a file inside a directory we
//! own (the staging directory or the backup directory). These helpers make
//! sure such a name can never resolve outside that directory.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Extension every installable package must carry
pub const PACKAGE_EXTENSION: &str = ".run";

/// Prefix and suffix of backup archive names
pub const BACKUP_PREFIX: &str = "backup_";
pub const BACKUP_SUFFIX: &str = ".tar.gz";

/// Sanitize a filename (single path component) from an untrusted source
///
/// Rejects path separators, `.`/`..`, NUL bytes and hidden names (a leading
/// dot is reserved for in-progress temp files).
///
/// # Examples
///
/// ```
/// use armnas::filesystem::path::sanitize_filename;
///
/// assert_eq!(sanitize_filename("update_v1.run").unwrap(), "update_v1.run");
/// assert!(sanitize_filename("../update.run").is_err());
/// assert!(sanitize_filename("sub/update.run").is_err());
/// ```
pub fn sanitize_filename(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(Error::InvalidPath("Empty filename".to_string()));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(Error::PathTraversal(format!(
            "Filename contains path separator: {}",
            name
        )));
    }

    if name == ".." || name == "." || name.contains("..") {
        return Err(Error::PathTraversal(format!("Invalid filename: {}", name)));
    }

    if name.contains('\0') {
        return Err(Error::InvalidPath("Filename contains NUL byte".to_string()));
    }

    if name.starts_with('.') {
        return Err(Error::InvalidPath(format!("Hidden filename not allowed: {}", name)));
    }

    Ok(name.to_string())
}

/// Validate the name of an installable package
///
/// Must be a sanitized single component ending in `.run` with a non-empty
/// stem.
pub fn validate_package_filename(name: &str) -> Result<String> {
    let name = sanitize_filename(name)?;

    match name.strip_suffix(PACKAGE_EXTENSION) {
        Some(stem) if !stem.is_empty() => Ok(name),
        _ => Err(Error::InvalidExtension {
            name,
            expected: PACKAGE_EXTENSION.to_string(),
        }),
    }
}

/// Validate the name of a backup archive
pub fn validate_backup_filename(name: &str) -> Result<String> {
    let name = sanitize_filename(name)?;

    if !name.starts_with(BACKUP_PREFIX) {
        return Err(Error::InvalidPath(format!(
            "Backup filename must start with '{}': {}",
            BACKUP_PREFIX, name
        )));
    }
    if !name.ends_with(BACKUP_SUFFIX) {
        return Err(Error::InvalidExtension {
            name,
            expected: BACKUP_SUFFIX.to_string(),
        });
    }

    Ok(name)
}

/// Join a validated filename onto a directory
///
/// The name must already have passed one of the validators above; this
/// re-checks that the result stays directly under `dir`.
pub fn join_in(dir: &Path, name: &str) -> Result<PathBuf> {
    let name = sanitize_filename(name)?;
    let joined = dir.join(&name);

    if joined.parent() != Some(dir) {
        return Err(Error::PathTraversal(format!(
            "{} escapes {}",
            joined.display(),
            dir.display()
        )));
    }

    Ok(joined)
}
