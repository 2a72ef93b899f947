//! Zip archive decoding into a basename-keyed content map.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use tracing::{debug, warn};

use super::PackageError;

/// Largest entry accepted from an archive. Flash windows are far smaller.
pub const MAX_ENTRY_SIZE: u64 = 16 * 1024 * 1024;

/// Archive contents keyed by entry basename.
///
/// Directory components are dropped. When two entries share a basename the
/// one that comes later in the archive's central directory replaces the
/// earlier one.
#[derive(Debug, Default, Clone)]
pub struct ContentMap {
    entries: BTreeMap<String, Arc<[u8]>>,
}

impl ContentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, returning the data it replaced.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
    ) -> Option<Arc<[u8]>> {
        let name = name.into();
        let replaced = self.entries.insert(name.clone(), data.into());
        if replaced.is_some() {
            warn!(name = %name, "Duplicate archive entry, later entry wins");
        }
        replaced
    }

    pub fn get(&self, name: &str) -> Option<&Arc<[u8]>> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decompress every file entry of a zip archive.
    pub fn from_zip(bytes: &[u8]) -> Result<Self, PackageError> {
        Self::from_zip_with_limit(bytes, MAX_ENTRY_SIZE)
    }

    /// Like [`from_zip`](Self::from_zip), rejecting entries that inflate past `limit` bytes.
    ///
    /// Sizes declared by the archive are not trusted; data is read until the
    /// stream ends or the limit is crossed.
    pub fn from_zip_with_limit(bytes: &[u8], limit: u64) -> Result<Self, PackageError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut map = Self::new();

        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            if file.is_dir() {
                continue;
            }

            let name = basename(file.name()).to_string();
            if name.is_empty() {
                continue;
            }

            let mut data = Vec::new();
            (&mut file).take(limit.saturating_add(1)).read_to_end(&mut data)?;
            if data.len() as u64 > limit {
                return Err(PackageError::EntryTooLarge { name, limit });
            }
            debug!(entry = %file.name(), name = %name, size = data.len(), "Decoded archive entry");
            map.insert(name, data);
        }

        Ok(map)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
