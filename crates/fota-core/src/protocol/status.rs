//! Control characteristic status byte.

use std::fmt;

use super::constants::*;

/// Device status read back from the control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlStatus {
    Disabled,
    Ok,
    Error,
    WaitData,
    Unknown(u8),
}

impl CtrlStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            OTA_CTRL_STATUS_DISABLED => Self::Disabled,
            OTA_CTRL_STATUS_OK => Self::Ok,
            OTA_CTRL_STATUS_ERROR => Self::Error,
            OTA_CTRL_STATUS_WAIT_DATA => Self::WaitData,
            other => Self::Unknown(other),
        }
    }

    /// An empty read counts as an error.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        bytes.first().map_or(Self::Error, |&b| Self::from_byte(b))
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Disabled => OTA_CTRL_STATUS_DISABLED,
            Self::Ok => OTA_CTRL_STATUS_OK,
            Self::Error => OTA_CTRL_STATUS_ERROR,
            Self::WaitData => OTA_CTRL_STATUS_WAIT_DATA,
            Self::Unknown(b) => b,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Status that ends a page-completion poll.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Ok | Self::Error)
    }
}

impl fmt::Display for CtrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtrlStatus::Disabled => write!(f, "DISABLED"),
            CtrlStatus::Ok => write!(f, "OK"),
            CtrlStatus::Error => write!(f, "ERROR"),
            CtrlStatus::WaitData => write!(f, "WAIT_DATA"),
            CtrlStatus::Unknown(b) => write!(f, "UNKNOWN(0x{b:02X})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes() {
        assert_eq!(CtrlStatus::from_bytes(&[1]), CtrlStatus::Ok);
        assert_eq!(CtrlStatus::from_bytes(&[3, 9]), CtrlStatus::WaitData);
        assert_eq!(CtrlStatus::from_bytes(&[]), CtrlStatus::Error);
        assert_eq!(CtrlStatus::from_bytes(&[0x42]), CtrlStatus::Unknown(0x42));
    }

    #[test]
    fn test_final() {
        assert!(CtrlStatus::Ok.is_final());
        assert!(CtrlStatus::Error.is_final());
        assert!(!CtrlStatus::WaitData.is_final());
        assert!(!CtrlStatus::Disabled.is_final());
    }
}
