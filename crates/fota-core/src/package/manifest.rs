//! `manifest.json` schema.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::version::Version;

/// Archive entry holding the manifest.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Archive entry holding release notes.
pub const README_NAME: &str = "readme";

/// Component with a version (platform or app).
#[derive(Debug, Clone, Deserialize)]
pub struct VersionedComponent {
    pub name: String,
    pub address: u32,
    #[serde(default)]
    pub version: Value,
}

impl VersionedComponent {
    /// Malformed versions degrade to `0.0.0`.
    pub fn version(&self) -> Version {
        Version::from_json(&self.version).unwrap_or_else(|e| {
            debug!(name = %self.name, error = %e, "Ignoring malformed version");
            Version::default()
        })
    }
}

/// Extra binary without version.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtraBin {
    pub name: String,
    pub address: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub entry: u32,
    #[serde(default)]
    pub platform: Option<VersionedComponent>,
    pub app: VersionedComponent,
    #[serde(default)]
    pub bins: Vec<ExtraBin>,
}

impl Manifest {
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
