//! Online package delivery.
//!
//! The server publishes `latest.json` naming the current archive:
//! `{"package": "<path or URL>"}`.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::package::{Package, PackageError};

/// Index file fetched from the server root.
pub const LATEST_INDEX: &str = "latest.json";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum OnlineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("Invalid latest.json: {0}")]
    Index(#[from] serde_json::Error),
    #[error("Invalid package: {0}")]
    Package(#[from] PackageError),
}

#[derive(Debug, Deserialize)]
struct LatestIndex {
    package: String,
}

/// Strip one trailing `/` from a server URL.
pub fn normalize_server(server: &str) -> &str {
    server.strip_suffix('/').unwrap_or(server)
}

/// URL of the index file.
pub fn index_url(server: &str) -> String {
    format!("{}/{LATEST_INDEX}", normalize_server(server))
}

/// Resolve the `package` field against the server. Absolute URLs are kept.
pub fn package_url(server: &str, package: &str) -> String {
    if package.starts_with("http://") || package.starts_with("https://") {
        return package.to_string();
    }
    format!(
        "{}/{}",
        normalize_server(server),
        package.trim_start_matches('/')
    )
}

/// Basename of a package path, as shown to users.
pub fn package_file_name(package: &str) -> &str {
    package.rsplit('/').next().unwrap_or(package)
}

/// Archive named by `latest.json`, downloaded and loaded.
#[derive(Debug, Clone)]
pub struct LatestPackage {
    pub url: String,
    pub archive: Vec<u8>,
    pub package: Package,
}

/// Blocking client for an update server.
pub struct UpdateServer {
    client: Client,
    server: String,
}

impl UpdateServer {
    pub fn new(server: impl Into<String>) -> Result<Self, OnlineError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(server, client))
    }

    pub fn with_client(server: impl Into<String>, client: Client) -> Self {
        Self {
            client,
            server: server.into(),
        }
    }

    fn get(&self, url: &str) -> Result<Vec<u8>, OnlineError> {
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(OnlineError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes()?.to_vec())
    }

    /// Fetch `latest.json` and return the resolved archive URL.
    pub fn latest_package_url(&self) -> Result<String, OnlineError> {
        let body = self.get(&index_url(&self.server))?;
        let index: LatestIndex = serde_json::from_slice(&body)?;
        Ok(package_url(&self.server, &index.package))
    }

    /// Download the raw archive named by `latest.json`.
    #[instrument(skip(self), fields(server = %self.server))]
    pub fn fetch_latest_archive(&self) -> Result<(String, Vec<u8>), OnlineError> {
        let url = self.latest_package_url()?;
        info!(url = %url, "Downloading package");
        let bytes = self.get(&url)?;
        info!(len = bytes.len(), "Package downloaded");
        Ok((url, bytes))
    }

    /// Download the latest archive and load it as a package.
    pub fn fetch_latest(&self) -> Result<LatestPackage, OnlineError> {
        let (url, archive) = self.fetch_latest_archive()?;
        let package = Package::load_from_archive(&archive)?;
        Ok(LatestPackage {
            url,
            archive,
            package,
        })
    }
}

/// Download and load the latest package from `server`.
pub fn fetch_latest(server: &str) -> Result<LatestPackage, OnlineError> {
    UpdateServer::new(server)?.fetch_latest()
}
