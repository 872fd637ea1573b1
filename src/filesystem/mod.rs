// src/filesystem/mod.rs

//! Filesystem helpers shared by the package store, backups and installer
//!
//! - `path` - filename validation for untrusted input
//! - [`copy_tree`] - overlay copy of a directory tree (used when replacing
//!   installed code)
//! - [`move_path`] - rename with a copy fallback across devices

pub mod path;

use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Copy `src` over `dst`, creating directories as needed
///
/// Existing files in `dst` are overwritten, files only present in `dst` are
/// left alone. Relative paths for which `skip` returns true are not copied
/// (nor descended into). Returns the number of files copied.
pub fn copy_tree<F>(src: &Path, dst: &Path, skip: F) -> Result<usize>
where
    F: Fn(&Path) -> bool,
{
    if !src.is_dir() {
        return Err(Error::NotFound(format!("Directory {}", src.display())));
    }
    fs::create_dir_all(dst)?;

    let mut copied = 0;
    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|entry| {
        entry
            .path()
            .strip_prefix(src)
            .map(|rel| !skip(rel))
            .unwrap_or(true)
    });

    for entry in walker {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::IoError(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            symlink(&link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    debug!("Copied {} files from {} to {}", copied, src.display(), dst.display());
    Ok(copied)
}

/// Move a file or directory, copying when a rename would cross devices
pub fn move_path(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            if src.is_dir() {
                copy_tree(src, dst, |_| false)?;
                fs::remove_dir_all(src)?;
            } else {
                fs::copy(src, dst)?;
                fs::remove_file(src)?;
            }
            Ok(())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Set mode bits on a file
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// True if any execute bit is set on a regular file
pub fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
