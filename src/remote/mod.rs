// src/remote/mod.rs

//! Client for the remote version registry
//!
//! # Protocol
//!
//! ```text
//! GET {base}/check-update?current_version=0.2.0
//!   204                      no update
//!   200 {update_available, latest_version, ...}
//!
//! GET {base}/changelog/{version}
//!   200 <json>
//! ```
//!
//! Two body shapes are in the wild and both are accepted:
//!
//! ```text
//! nested: {"update_available": true,
//!          "latest_version": {"version", "download_url", "sha256", "size",
//!                             "changelog", "critical", "created"}}
//! flat:   {"update_available": true, "latest_version": "0.2.1",
//!          "download_url", "checksum", "file_size", "changelog": [...],
//!          "critical", "release_date"}
//! ```
//!
//! An unreachable or slow registry is reported as "no update" so a dead
//! registry never blocks the appliance UI.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Update offered by the registry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateInfo {
    pub version: String,
    pub download_url: String,
    pub sha256: Option<String>,
    pub changelog: Vec<String>,
    pub critical: bool,
    pub size: Option<u64>,
    pub release_date: Option<String>,
}

/// Outcome of a registry check
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Registry answered and offers this update
    Available(UpdateInfo),
    /// Registry answered with no update
    UpToDate,
    /// Registry could not be reached in time
    Unreachable(String),
}

/// Changelog given either as one block of text or as a list of lines
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Changelog {
    Text(String),
    Lines(Vec<String>),
}

impl Changelog {
    pub(crate) fn into_lines(self) -> Vec<String> {
        match self {
            Self::Text(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Self::Lines(lines) => lines,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct NestedLatest {
    version: Option<String>,
    download_url: Option<String>,
    #[serde(alias = "checksum")]
    sha256: Option<String>,
    #[serde(alias = "file_size")]
    size: Option<u64>,
    changelog: Option<Changelog>,
    #[serde(default)]
    critical: bool,
    #[serde(alias = "release_date")]
    created: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LatestField {
    Version(String),
    Nested(NestedLatest),
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    update_available: bool,
    latest_version: Option<LatestField>,
    download_url: Option<String>,
    #[serde(alias = "sha256")]
    checksum: Option<String>,
    #[serde(alias = "size")]
    file_size: Option<u64>,
    changelog: Option<Changelog>,
    #[serde(default)]
    critical: bool,
    #[serde(alias = "created")]
    release_date: Option<String>,
    error: Option<String>,
}

impl CheckResponse {
    /// Merge both body shapes into one [`UpdateInfo`]
    fn into_update(self) -> Result<Option<UpdateInfo>> {
        if !self.update_available {
            if let Some(err) = self.error {
                debug!("Registry reported: {}", err);
            }
            return Ok(None);
        }

        let nested = match self.latest_version {
            Some(LatestField::Version(v)) => NestedLatest {
                version: Some(v),
                ..Default::default()
            },
            Some(LatestField::Nested(n)) => n,
            None => NestedLatest::default(),
        };

        let version = nested
            .version
            .ok_or_else(|| Error::ParseError("Registry response lacks latest version".to_string()))?;
        let download_url = nested
            .download_url
            .or(self.download_url)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::ParseError("Registry response lacks download_url".to_string()))?;

        Ok(Some(UpdateInfo {
            version,
            download_url,
            sha256: nested.sha256.or(self.checksum).filter(|s| !s.is_empty()),
            changelog: nested
                .changelog
                .or(self.changelog)
                .map(Changelog::into_lines)
                .unwrap_or_default(),
            critical: nested.critical || self.critical,
            size: nested.size.or(self.file_size),
            release_date: nested.created.or(self.release_date),
        }))
    }
}

/// Registry client
#[derive(Clone)]
pub struct RemoteVersionSource {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteVersionSource {
    /// Create a client with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("armnas/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the registry whether something newer than `current` exists
    ///
    /// Timeouts and connection failures yield [`CheckOutcome::Unreachable`];
    /// an HTTP error status or an unparseable body is an error.
    pub async fn check(&self, current: &str) -> Result<CheckOutcome> {
        let url = format!("{}/check-update", self.base_url);
        debug!("Checking {} for updates (current {})", url, current);

        let response = match self
            .client
            .get(&url)
            .query(&[("current_version", current)])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                warn!("Update registry unreachable at {}: {}", url, e);
                return Ok(CheckOutcome::Unreachable(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(CheckOutcome::UpToDate);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::DownloadError(format!(
                "Registry returned HTTP {}: {}",
                status,
                body.trim()
            )));
        }

        let body: CheckResponse = match response.json().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => {
                warn!("Update registry timed out while sending body: {}", e);
                return Ok(CheckOutcome::Unreachable(e.to_string()));
            }
            Err(e) => return Err(Error::ParseError(format!("Bad registry response: {}", e))),
        };

        match body.into_update()? {
            Some(info) => {
                info!("Registry offers version {}", info.version);
                Ok(CheckOutcome::Available(info))
            }
            None => Ok(CheckOutcome::UpToDate),
        }
    }

    /// Fetch the changelog for a version
    pub async fn changelog(&self, version: &str) -> Result<serde_json::Value> {
        crate::version::VersionInfo::parse(version)?;
        let url = format!("{}/changelog/{}", self.base_url, version);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("Changelog for {}", version)));
        }
        if !status.is_success() {
            return Err(Error::DownloadError(format!(
                "Registry returned HTTP {} for changelog {}",
                status, version
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::ParseError(format!("Bad changelog response: {}", e)))
    }
}
