//! Component versions reported by devices and carried by update packages.

use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while reading a version triplet.
///
/// Manifest loading treats these as non-fatal and falls back to `0.0.0`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("Version must be an array of 3 integers, got {0}")]
    NotATriplet(String),
    #[error("Version component out of range: {0}")]
    OutOfRange(i64),
    #[error("Invalid version string: {0}")]
    InvalidString(String),
    #[error("Version record too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Version triplet (major, minor, patch).
///
/// Ordering is lexicographic over `(major, minor, patch)`. `major` is signed
/// because single-binary packages carry a negative sentinel major.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}

impl Version {
    /// Size of one version record on the wire.
    pub const WIRE_SIZE: usize = 4;

    pub const fn new(major: i32, minor: i32, patch: i32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Sentinel carried by single-binary packages.
    pub const fn sentinel() -> Self {
        Self::new(-1, 0, 0)
    }

    /// Decode a device record: u16 LE major, u8 minor, u8 patch.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, VersionParseError> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(VersionParseError::TooShort {
                expected: Self::WIRE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            major: LittleEndian::read_u16(&bytes[0..2]) as i32,
            minor: bytes[2] as i32,
            patch: bytes[3] as i32,
        })
    }

    /// Parse a manifest `[major, minor, patch]` array.
    pub fn from_json(value: &Value) -> Result<Self, VersionParseError> {
        let parts = match value.as_array() {
            Some(parts) if parts.len() == 3 => parts,
            _ => return Err(VersionParseError::NotATriplet(value.to_string())),
        };

        let mut out = [0i32; 3];
        for (slot, part) in out.iter_mut().zip(parts) {
            let n = part
                .as_i64()
                .ok_or_else(|| VersionParseError::NotATriplet(value.to_string()))?;
            *slot = i32::try_from(n).map_err(|_| VersionParseError::OutOfRange(n))?;
        }
        Ok(Self::new(out[0], out[1], out[2]))
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(VersionParseError::InvalidString(s.to_string()));
        }
        let parse = |p: &str| {
            p.parse::<i32>()
                .map_err(|_| VersionParseError::InvalidString(s.to_string()))
        };
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.major >= 0 {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        } else {
            write!(f, "\u{221e}")
        }
    }
}

/// Versions of the two independently updated components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProductVersion {
    pub platform: Version,
    pub app: Version,
}

impl ProductVersion {
    /// Size of the device version characteristic.
    pub const WIRE_SIZE: usize = 2 * Version::WIRE_SIZE;

    pub const fn new(platform: Version, app: Version) -> Self {
        Self { platform, app }
    }

    /// Decode the version characteristic (platform record, then app record).
    pub fn from_wire(bytes: &[u8]) -> Result<Self, VersionParseError> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(VersionParseError::TooShort {
                expected: Self::WIRE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            platform: Version::from_wire(&bytes[..Version::WIRE_SIZE])?,
            app: Version::from_wire(&bytes[Version::WIRE_SIZE..])?,
        })
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "platform {} / app {}", self.platform, self.app)
    }
}
