//! Update package loading.
//!
//! A package is a zip archive holding `manifest.json`, the binaries it names
//! and an optional `readme`. See [`Package::load_from_archive`].

pub mod archive;
pub mod manifest;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use crate::version::{ProductVersion, Version};

pub use archive::ContentMap;
pub use manifest::{MANIFEST_NAME, Manifest, README_NAME};

/// Readme text used when the archive has none.
pub const NO_README: &str = "<null>";

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Archive has no manifest.json")]
    MissingManifest,
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("Manifest references missing entry: {0}")]
    MissingEntry(String),
    #[error("Archive entry {name} exceeds {limit} bytes")]
    EntryTooLarge { name: String, limit: u64 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One binary to be written to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateItem {
    pub name: String,
    pub data: Arc<[u8]>,
    pub load_addr: u32,
    /// Assigned once a chip family is chosen.
    pub write_addr: Option<u32>,
}

impl UpdateItem {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>, load_addr: u32) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            load_addr,
            write_addr: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parsed update package. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Package {
    pub platform: Option<UpdateItem>,
    pub app: UpdateItem,
    pub extra_bins: Vec<UpdateItem>,
    pub version: ProductVersion,
    pub entry: u32,
    pub readme: String,
}

impl Package {
    /// Decode a zip archive.
    #[instrument(skip(bytes), fields(len = bytes.len()))]
    pub fn load_from_archive(bytes: &[u8]) -> Result<Self, PackageError> {
        let contents = ContentMap::from_zip(bytes)?;
        Self::from_contents(&contents)
    }

    /// Read and decode a zip archive from disk.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PackageError> {
        let bytes = std::fs::read(path)?;
        Self::load_from_archive(&bytes)
    }

    /// Build a package from already decoded archive contents.
    pub fn from_contents(contents: &ContentMap) -> Result<Self, PackageError> {
        let manifest_data = contents
            .get(MANIFEST_NAME)
            .ok_or(PackageError::MissingManifest)?;
        let manifest = Manifest::from_slice(manifest_data)?;

        let item = |name: &str, load_addr: u32| -> Result<UpdateItem, PackageError> {
            let data = contents
                .get(name)
                .ok_or_else(|| PackageError::MissingEntry(name.to_string()))?;
            Ok(UpdateItem::new(name, Arc::clone(data), load_addr))
        };

        let platform = manifest
            .platform
            .as_ref()
            .map(|p| item(&p.name, p.address))
            .transpose()?;
        let app = item(&manifest.app.name, manifest.app.address)?;
        let extra_bins = manifest
            .bins
            .iter()
            .map(|b| item(&b.name, b.address))
            .collect::<Result<Vec<_>, _>>()?;

        let version = ProductVersion::new(
            manifest
                .platform
                .as_ref()
                .map(|p| p.version())
                .unwrap_or_default(),
            manifest.app.version(),
        );

        let readme = contents
            .get(README_NAME)
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .unwrap_or_else(|| NO_README.to_string());

        info!(
            version = %version,
            platform = platform.is_some(),
            extra_bins = extra_bins.len(),
            "Loaded update package"
        );

        Ok(Self {
            platform,
            app,
            extra_bins,
            version,
            entry: manifest.entry,
            readme,
        })
    }

    /// Wrap a single app binary for on-the-fly delivery.
    pub fn single_app(
        load_addr: u32,
        data: impl Into<Arc<[u8]>>,
        file_name: impl Into<String>,
        readme: impl Into<String>,
    ) -> Self {
        Self {
            platform: None,
            app: UpdateItem::new(file_name, data, load_addr),
            extra_bins: Vec::new(),
            version: ProductVersion::new(Version::default(), Version::sentinel()),
            entry: 0,
            readme: readme.into(),
        }
    }

    /// Readme text for an on-the-fly app package.
    pub fn single_app_readme(load_addr: u32, file_name: &str) -> String {
        format!("On-the-fly update App:\n\n@0x{load_addr:08x} ({file_name})")
    }

    /// Whether this package only carries an app binary.
    pub fn is_app_only(&self) -> bool {
        self.platform.is_none()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    pub(crate) fn sample_archive() -> Vec<u8> {
        let manifest = br#"{
            "entry": 16384,
            "platform": {"name": "platform.bin", "address": 16384, "version": [1, 2, 0]},
            "app": {"name": "app.bin", "address": 155648, "version": [3, 0, 1]},
            "bins": [{"name": "res.bin", "address": 262144}]
        }"#;
        build_zip(&[
            ("fw/manifest.json", manifest),
            ("fw/platform.bin", &[0xAA; 300]),
            ("fw/app.bin", &[0xBB; 100]),
            ("fw/res.bin", &[0xCC; 10]),
            ("readme", b"release notes"),
        ])
    }

    #[test]
    fn test_load_full_package() {
        let pack = Package::load_from_archive(&sample_archive()).unwrap();
        assert_eq!(pack.entry, 0x4000);
        assert_eq!(pack.version.platform, Version::new(1, 2, 0));
        assert_eq!(pack.version.app, Version::new(3, 0, 1));

        let platform = pack.platform.as_ref().unwrap();
        assert_eq!(platform.name, "platform.bin");
        assert_eq!(platform.load_addr, 0x4000);
        assert_eq!(platform.len(), 300);
        assert_eq!(platform.write_addr, None);

        assert_eq!(pack.app.load_addr, 0x26000);
        assert_eq!(pack.extra_bins.len(), 1);
        assert_eq!(pack.extra_bins[0].load_addr, 0x40000);
        assert_eq!(pack.readme, "release notes");
    }

    #[test]
    fn test_missing_manifest() {
        let zip = build_zip(&[("app.bin", b"x")]);
        assert!(matches!(
            Package::load_from_archive(&zip),
            Err(PackageError::MissingManifest)
        ));
    }

    #[test]
    fn test_missing_referenced_entry() {
        let manifest = br#"{
            "entry": 0,
            "app": {"name": "app.bin", "address": 0, "version": [1, 0, 0]},
            "bins": [{"name": "gone.bin", "address": 0}]
        }"#;
        let zip = build_zip(&[("manifest.json", manifest), ("app.bin", b"x")]);
        match Package::load_from_archive(&zip) {
            Err(PackageError::MissingEntry(name)) => assert_eq!(name, "gone.bin"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_defaults_without_platform_and_readme() {
        let manifest =
            br#"{"entry": 7, "app": {"name": "app.bin", "address": 4096, "version": "bogus"}}"#;
        let zip = build_zip(&[("manifest.json", manifest), ("app.bin", b"abc")]);
        let pack = Package::load_from_archive(&zip).unwrap();
        assert!(pack.is_app_only());
        assert_eq!(pack.readme, NO_README);
        assert_eq!(pack.version.app, Version::default());
        assert_eq!(pack.version.platform, Version::default());
    }

    #[test]
    fn test_single_app_package() {
        let readme = Package::single_app_readme(0x2000, "app.bin");
        let pack = Package::single_app(0x2000, vec![1u8, 2, 3], "app.bin", readme.clone());
        assert!(pack.is_app_only());
        assert_eq!(pack.entry, 0);
        assert_eq!(pack.version.platform, Version::new(0, 0, 0));
        assert_eq!(pack.version.app, Version::sentinel());
        assert_eq!(pack.readme, "On-the-fly update App:\n\n@0x00002000 (app.bin)");
    }
}
