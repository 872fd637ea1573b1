// src/error.rs

//! Error types for the update subsystem
//!
//! Errors fall into a small number of classes that callers care about:
//!
//! | Class | Variants | HTTP |
//! |-------|----------|------|
//! | Validation | `InvalidPath`, `InvalidUrl`, `PathTraversal`, `InvalidExtension`, `MissingField`, `TooLarge` | 400 / 413 |
//! | Integrity | `ChecksumMismatch` | 400 |
//! | Not found | `NotFound` | 404 |
//! | External tool | `CommandFailed`, `ToolNotFound`, `SpawnFailed` | 500 |
//!
//! Validation and integrity errors are raised before any package reaches the
//! backup or install stage.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("Invalid extension for {name}: expected {expected}")]
    InvalidExtension { name: String, expected: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Upload exceeds maximum size of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Required tool not found: {0}")]
    ToolNotFound(String),

    #[error("Failed to launch installer: {0}")]
    SpawnFailed(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Install step '{step}' failed: {reason}")]
    InstallFailed { step: String, reason: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl Error {
    /// True for errors caused by bad caller input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath(_)
                | Self::InvalidUrl(_)
                | Self::PathTraversal(_)
                | Self::InvalidExtension { .. }
                | Self::MissingField(_)
                | Self::TooLarge { .. }
        )
    }

    /// True for checksum failures
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }

    /// True when an external command or process could not do its job
    pub fn is_external_tool(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed(_) | Self::ToolNotFound(_) | Self::SpawnFailed(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::DownloadError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
