// src/store/mod.rs

//! Staging area for `.run` update packages
//!
//! The package store owns every file in the staging directory:
//!
//! ```text
//! /tmp/armnas_updates/
//!   armnas_0.2.1.run              # package, mode 0755
//!   armnas_0.2.1.run.sha256       # digest recorded when it was staged
//!   .armnas_0.2.2.run.<id>.part   # upload in progress (never listed)
//!   install_armnas_0.2.1.run.log  # output of the detached installer
//!   install_armnas_0.2.1.run.exit # installer exit code once finished
//!   install_armnas_0.2.1.run.pid  # installer pid and the pid that launched it
//! ```
//!
//! Uploads and downloads stream into a hidden temp file while being hashed
//! and are renamed into place only when complete, so a concurrent `list()`
//! either does not see a package yet or sees all of it.

use crate::backup::bytes_to_mb;
use crate::config::ArmnasConfig;
use crate::error::{Error, Result};
use crate::filesystem::path::{join_in, validate_package_filename};
use crate::hash::{self, StreamHasher};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Default upload limit (500 MB)
pub const DEFAULT_MAX_SIZE: u64 = 500 * 1024 * 1024;

const SIDECAR_SUFFIX: &str = ".sha256";

/// A staged package
#[derive(Debug, Clone, Serialize)]
pub struct Package {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub size_mb: f64,
    pub sha256: String,
    pub downloaded: DateTime<Utc>,
    pub executable: bool,
}

/// Result of a remote fetch
#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    #[serde(flatten)]
    pub package: Package,
    /// False when no expected digest was supplied
    pub verified: bool,
}

/// A completed download that is not yet visible in the staging directory
#[derive(Debug)]
pub struct PendingPackage {
    pub filename: String,
    pub size: u64,
    pub sha256: String,
    temp: PathBuf,
    final_path: PathBuf,
}

/// Owns the staging directory
#[derive(Clone)]
pub struct PackageStore {
    staging_dir: PathBuf,
    max_size: u64,
    client: reqwest::Client,
}

impl PackageStore {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            max_size: DEFAULT_MAX_SIZE,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Build a store from configuration
    pub fn from_config(config: &ArmnasConfig) -> anyhow::Result<Self> {
        let client = download_client(config.connect_timeout()?, config.download_timeout()?)?;
        Ok(Self::new(&config.paths.staging_dir)
            .with_max_size(config.max_upload_bytes()?)
            .with_client(client))
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Path of a validated package name
    pub fn path_for(&self, filename: &str) -> Result<PathBuf> {
        let filename = validate_package_filename(filename)?;
        join_in(&self.staging_dir, &filename)
    }

    /// Log file the detached installer writes for `filename`
    pub fn log_path(&self, filename: &str) -> Result<PathBuf> {
        let filename = validate_package_filename(filename)?;
        Ok(self.staging_dir.join(format!("install_{}.log", filename)))
    }

    /// Exit-code marker written when the detached installer finishes
    pub fn exit_marker_path(&self, filename: &str) -> Result<PathBuf> {
        let filename = validate_package_filename(filename)?;
        Ok(self.staging_dir.join(format!("install_{}.exit", filename)))
    }

    /// Pid file of the detached installer for `filename`
    pub fn pid_file_path(&self, filename: &str) -> Result<PathBuf> {
        let filename = validate_package_filename(filename)?;
        Ok(self.staging_dir.join(format!("install_{}.pid", filename)))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(SIDECAR_SUFFIX);
        PathBuf::from(os)
    }

    fn temp_path(&self, filename: &str) -> PathBuf {
        self.staging_dir
            .join(format!(".{}.{}.part", filename, uuid::Uuid::new_v4().simple()))
    }

    /// Stream `stream` into a temp file, hashing as it goes
    ///
    /// Returns `(size, sha256)`. The temp file is removed on any failure.
    async fn write_stream<S, T, E>(&self, temp: &Path, stream: S) -> Result<(u64, String)>
    where
        S: Stream<Item = std::result::Result<T, E>>,
        T: AsRef<[u8]>,
        E: Display,
    {
        let result = async {
            let mut file = fs::File::create(temp).await?;
            let mut hasher = StreamHasher::new();
            let mut stream = std::pin::pin!(stream);

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| Error::DownloadError(e.to_string()))?;
                let data = chunk.as_ref();
                if hasher.len() + data.len() as u64 > self.max_size {
                    return Err(Error::TooLarge {
                        limit: self.max_size,
                    });
                }
                hasher.update(data);
                file.write_all(data).await?;
            }

            file.flush().await?;
            file.sync_all().await?;
            Ok((hasher.len(), hasher.finalize()))
        }
        .await;

        if result.is_err() {
            remove_if_present(temp).await;
        }
        result
    }

    /// Move a completed temp file into place, then record its digest
    ///
    /// A stale sidecar is dropped before the rename, so a package is never
    /// paired with another upload's digest. Without a sidecar the package
    /// is refused at install time.
    async fn commit(&self, temp: &Path, final_path: &Path, sha256: &str) -> Result<()> {
        let sidecar = Self::sidecar_path(final_path);

        let moved = async {
            fs::set_permissions(temp, std::fs::Permissions::from_mode(0o755)).await?;
            match fs::remove_file(&sidecar).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
            fs::rename(temp, final_path).await?;
            Ok::<_, Error>(())
        }
        .await;
        if moved.is_err() {
            remove_if_present(temp).await;
            return moved;
        }

        if let Err(e) = fs::write(&sidecar, format!("{}\n", sha256)).await {
            warn!("Failed to record digest for {}: {}", final_path.display(), e);
            remove_if_present(final_path).await;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Store an uploaded package from a byte stream
    pub async fn store_stream<S, T, E>(&self, filename: &str, stream: S) -> Result<Package>
    where
        S: Stream<Item = std::result::Result<T, E>>,
        T: AsRef<[u8]>,
        E: Display,
    {
        let final_path = self.path_for(filename)?;
        fs::create_dir_all(&self.staging_dir).await?;

        let temp = self.temp_path(filename);
        let (size, sha256) = self.write_stream(&temp, stream).await?;
        self.commit(&temp, &final_path, &sha256).await?;

        info!("Stored package {} ({} bytes, sha256 {})", filename, size, sha256);
        self.get(filename).await
    }

    /// Store a package held in memory
    pub async fn store_bytes(&self, filename: &str, data: &[u8]) -> Result<Package> {
        let chunks = data
            .chunks(hash::CHUNK_SIZE)
            .map(|c| Ok::<_, std::convert::Infallible>(c.to_vec()));
        self.store_stream(filename, futures::stream::iter(chunks)).await
    }

    /// Download a package into a hidden temp file
    ///
    /// The result is not visible to `list()` until committed.
    pub async fn download(&self, url: &str, filename: &str) -> Result<PendingPackage> {
        let final_path = self.path_for(filename)?;
        let parsed = url::Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(format!("Unsupported scheme: {}", parsed.scheme())));
        }

        fs::create_dir_all(&self.staging_dir).await?;
        info!("Downloading {} from {}", filename, url);

        let response = self.client.get(parsed).send().await?;
        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }
        if let Some(len) = response.content_length()
            && len > self.max_size
        {
            return Err(Error::TooLarge {
                limit: self.max_size,
            });
        }

        let temp = self.temp_path(filename);
        let (size, sha256) = self.write_stream(&temp, response.bytes_stream()).await?;
        debug!("Downloaded {} bytes of {} (sha256 {})", size, filename, sha256);

        Ok(PendingPackage {
            filename: filename.to_string(),
            temp,
            final_path,
            size,
            sha256,
        })
    }

    /// Compare a pending download against an expected digest
    ///
    /// On mismatch the download is deleted and `ChecksumMismatch` returned.
    pub async fn verify_pending(&self, pending: &PendingPackage, expected: &str) -> Result<()> {
        let expected = hash::normalize_hex(expected);
        if pending.sha256 == expected {
            return Ok(());
        }

        warn!(
            "Checksum mismatch for {}: expected {}, got {}; discarding download",
            pending.filename, expected, pending.sha256
        );
        remove_if_present(&pending.temp).await;
        Err(Error::ChecksumMismatch {
            expected,
            actual: pending.sha256.clone(),
        })
    }

    /// Make a pending download visible in the staging directory
    pub async fn commit_pending(&self, pending: PendingPackage) -> Result<Package> {
        self.commit(&pending.temp, &pending.final_path, &pending.sha256).await?;
        info!("Staged {} ({} bytes)", pending.filename, pending.size);
        self.get(&pending.filename).await
    }

    /// Throw away a pending download
    pub async fn discard_pending(&self, pending: PendingPackage) {
        remove_if_present(&pending.temp).await;
    }

    /// Download, verify when a digest is supplied, and stage a package
    ///
    /// A mismatching download never becomes visible under its real name.
    pub async fn fetch(&self, url: &str, filename: &str, expected: Option<&str>) -> Result<FetchOutcome> {
        let pending = self.download(url, filename).await?;

        let verified = match expected {
            Some(expected) => {
                self.verify_pending(&pending, expected).await?;
                true
            }
            None => {
                warn!("No checksum supplied for {}; download is unverified", filename);
                false
            }
        };

        Ok(FetchOutcome {
            package: self.commit_pending(pending).await?,
            verified,
        })
    }

    async fn package_at(&self, filename: &str, path: &Path) -> Result<Package> {
        let metadata = fs::metadata(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("Package {}", filename)),
            _ => Error::Io(e),
        })?;
        if !metadata.is_file() {
            return Err(Error::NotFound(format!("Package {}", filename)));
        }

        let sha256 = match fs::read_to_string(Self::sidecar_path(path)).await {
            Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => hash::file_sha256_async(path.to_path_buf()).await?,
        };

        let size = metadata.len();
        Ok(Package {
            filename: filename.to_string(),
            path: path.to_path_buf(),
            size,
            size_mb: bytes_to_mb(size),
            sha256,
            downloaded: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH).into(),
            executable: metadata.permissions().mode() & 0o111 != 0,
        })
    }

    /// Look up one staged package
    pub async fn get(&self, filename: &str) -> Result<Package> {
        let path = self.path_for(filename)?;
        self.package_at(filename, &path).await
    }

    /// All staged packages, newest first
    pub async fn list(&self) -> Result<Vec<Package>> {
        let mut packages = Vec::new();
        let mut entries = match fs::read_dir(&self.staging_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(packages),
            Err(e) => return Err(Error::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_package_filename(&name).is_err() {
                continue;
            }
            match self.package_at(&name, &entry.path()).await {
                Ok(pkg) => packages.push(pkg),
                // Deleted between read_dir and stat
                Err(Error::NotFound(_)) => continue,
                Err(e) => debug!("Skipping {}: {}", name, e),
            }
        }

        packages.sort_by(|a, b| b.downloaded.cmp(&a.downloaded).then_with(|| a.filename.cmp(&b.filename)));
        Ok(packages)
    }

    /// Delete a staged package and its sidecar
    pub async fn delete(&self, filename: &str) -> Result<()> {
        let path = self.path_for(filename)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                remove_if_present(&Self::sidecar_path(&path)).await;
                info!("Deleted package {}", filename);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Package {}", filename)))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Re-hash a staged package against the digest recorded at staging time
    ///
    /// A mismatch purges the package. A package without a recorded digest
    /// is refused with `Conflict`. Returns the verified digest.
    pub async fn verify_staged(&self, filename: &str) -> Result<String> {
        let path = self.path_for(filename)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(Error::NotFound(format!("Package {}", filename)));
        }

        let sidecar = Self::sidecar_path(&path);
        match fs::read_to_string(&sidecar).await {
            Ok(recorded) if !recorded.trim().is_empty() => {
                let result = hash::verify_or_purge_async(path, recorded.trim().to_string()).await;
                if result.is_err() {
                    remove_if_present(&sidecar).await;
                }
                result
            }
            _ => {
                warn!("No recorded digest for {}; refusing to install it", filename);
                Err(Error::Conflict(format!(
                    "Package {} has no recorded checksum; upload or download it again",
                    filename
                )))
            }
        }
    }
}

/// Remove a file, logging any failure other than it already being gone
async fn remove_if_present(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// HTTP client for package downloads
pub fn download_client(connect_timeout: Duration, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(timeout)
        .user_agent(concat!("armnas/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::DownloadError(format!("Failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> PackageStore {
        PackageStore::new(dir.path().join("staging"))
    }

    #[tokio::test]
    async fn test_store_and_list() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let pkg = store.store_bytes("update_v1.run", b"#!/bin/sh\necho hi\n").await.unwrap();
        assert_eq!(pkg.filename, "update_v1.run");
        assert_eq!(pkg.sha256, hash::sha256(b"#!/bin/sh\necho hi\n"));
        assert!(pkg.executable);

        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].sha256, pkg.sha256);
    }

    #[tokio::test]
    async fn test_store_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        for name in ["../../etc/passwd", "a/b.run", "..run", "update.sh", ".hidden.run"] {
            assert!(store.store_bytes(name, b"x").await.is_err(), "{} accepted", name);
        }
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_enforces_max_size() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).with_max_size(16);

        let err = store.store_bytes("big.run", &[0u8; 64]).await.unwrap_err();
        assert!(matches!(err, Error::TooLarge { limit: 16 }));

        // Nothing left behind, not even the temp file
        let leftovers: Vec<_> = std::fs::read_dir(store.staging_dir()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_delete_twice() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_bytes("update.run", b"data").await.unwrap();

        store.delete("update.run").await.unwrap();
        assert!(matches!(store.delete("update.run").await, Err(Error::NotFound(_))));
        assert!(!store.staging_dir().join("update.run.sha256").exists());
    }

    #[tokio::test]
    async fn test_list_hides_partial_uploads() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.staging_dir()).unwrap();
        std::fs::write(store.staging_dir().join(".update.run.abc.part"), b"half").unwrap();
        std::fs::write(store.staging_dir().join("install_update.run.log"), b"log").unwrap();

        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_staged_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let pkg = store.store_bytes("update.run", b"original payload").await.unwrap();

        assert_eq!(store.verify_staged("update.run").await.unwrap(), pkg.sha256);

        std::fs::write(&pkg.path, b"original payloaX").unwrap();
        let err = store.verify_staged("update.run").await.unwrap_err();
        assert!(err.is_integrity());
        assert!(!pkg.path.exists());
    }

    #[tokio::test]
    async fn test_verify_staged_refuses_without_digest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let pkg = store.store_bytes("update.run", b"payload").await.unwrap();
        std::fs::remove_file(store.staging_dir().join("update.run.sha256")).unwrap();

        let err = store.verify_staged("update.run").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(pkg.path.exists());
    }

    #[tokio::test]
    async fn test_restage_replaces_digest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_bytes("update.run", b"first").await.unwrap();
        let second = store.store_bytes("update.run", b"second").await.unwrap();

        assert_eq!(second.sha256, hash::sha256(b"second"));
        assert_eq!(store.verify_staged("update.run").await.unwrap(), second.sha256);
    }

    #[tokio::test]
    async fn test_verify_staged_missing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(store.verify_staged("nope.run").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fetch_rejects_bad_url() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.fetch("ftp://example.com/x.run", "x.run", None).await,
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            store.fetch("not a url", "x.run", None).await,
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_artifact_paths() {
        let store = PackageStore::new("/tmp/armnas_updates");
        assert_eq!(
            store.log_path("update.run").unwrap(),
            PathBuf::from("/tmp/armnas_updates/install_update.run.log")
        );
        assert_eq!(
            store.exit_marker_path("update.run").unwrap(),
            PathBuf::from("/tmp/armnas_updates/install_update.run.exit")
        );
        assert_eq!(
            store.pid_file_path("update.run").unwrap(),
            PathBuf::from("/tmp/armnas_updates/install_update.run.pid")
        );
        assert!(store.log_path("../x.run").is_err());
    }
}
