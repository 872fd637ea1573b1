// src/hash.rs

//! SHA-256 hashing for package integrity
//!
//! Packages can be hundreds of megabytes, so everything here streams in
//! fixed-size chunks instead of reading whole files into memory.
//!
//! | Operation | Blocking | Async |
//! |-----------|----------|-------|
//! | Hash a file | [`file_sha256`] | [`file_sha256_async`] |
//! | Compare against expected | [`verify_file`] | [`verify_file_async`] |
//! | Compare and delete on mismatch | [`verify_or_purge`] | [`verify_or_purge_async`] |

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Chunk size for streaming reads
pub const CHUNK_SIZE: usize = 8192;

/// Incremental SHA-256 hasher for data that arrives in pieces
///
/// Used by the package store to hash an upload while it is being written.
#[derive(Default)]
pub struct StreamHasher {
    inner: Sha256,
    len: u64,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed data into the hasher
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish and return the lowercase hex digest
    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Hash everything a reader produces
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = StreamHasher::new();
    let mut buffer = [0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Compute SHA-256 of in-memory data
#[inline]
pub fn sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the SHA-256 hex digest of a file
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Io(e),
    })?;
    Ok(hash_reader(&mut file)?)
}

/// Normalize a user-supplied hex digest for comparison
///
/// Accepts an optional `sha256:` prefix and any letter case.
pub fn normalize_hex(expected: &str) -> String {
    let trimmed = expected.trim();
    let bare = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);
    bare.to_ascii_lowercase()
}

/// Check whether a file's content matches an expected digest
///
/// Returns `Ok(false)` on mismatch; I/O failures are errors.
pub fn verify_file(path: &Path, expected: &str) -> Result<bool> {
    let actual = file_sha256(path)?;
    Ok(actual == normalize_hex(expected))
}

/// Verify a file and delete it when the digest does not match
///
/// A package that fails verification must never stay in the staging
/// directory under a legitimate-looking name. Returns the actual digest on
/// success.
pub fn verify_or_purge(path: &Path, expected: &str) -> Result<String> {
    let actual = file_sha256(path)?;
    let expected = normalize_hex(expected);

    if actual == expected {
        return Ok(actual);
    }

    warn!(
        "Checksum mismatch for {}: expected {}, got {}; removing file",
        path.display(),
        expected,
        actual
    );
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Failed to remove untrusted file {}: {}", path.display(), e);
    }

    Err(Error::ChecksumMismatch { expected, actual })
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::IoError(format!("Hash task join error: {}", e)))?
}

/// [`file_sha256`] on the blocking pool
pub async fn file_sha256_async(path: PathBuf) -> Result<String> {
    run_blocking(move || file_sha256(&path)).await
}

/// [`verify_file`] on the blocking pool
pub async fn verify_file_async(path: PathBuf, expected: String) -> Result<bool> {
    run_blocking(move || verify_file(&path, &expected)).await
}

/// [`verify_or_purge`] on the blocking pool
pub async fn verify_or_purge_async(path: PathBuf, expected: String) -> Result<String> {
    run_blocking(move || verify_or_purge(&path, &expected)).await
}
