//! Device link abstraction.
//!
//! Defines the `FotaTransport` trait over the FOTA GATT service, so the
//! orchestrator can run against a radio stack or the in-memory simulator.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::{ATT_HEADER_SIZE, CtrlCommand, CtrlStatus};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to {0} failed")]
    ConnectFailed(String),

    #[error("INGChips FOTA Service is not available")]
    ServiceNotFound,

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(&'static str),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Device disconnected")]
    Disconnected,
}

/// Address of a peripheral, as reported by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Connected FOTA service on one device.
///
/// All calls block until the link layer completes them. Implementations
/// must tolerate `disconnect` being called from another thread while a
/// read or write is in flight.
pub trait FotaTransport: Send + Sync {
    /// Negotiated ATT MTU.
    fn att_mtu(&self) -> usize;

    /// Whether the public-key characteristic is present.
    fn has_secure_channel(&self) -> bool;

    /// Read the 8-byte version characteristic.
    fn read_version(&self) -> Result<Vec<u8>, TransportError>;

    fn read_ctrl(&self) -> Result<Vec<u8>, TransportError>;

    fn write_ctrl(&self, data: &[u8]) -> Result<(), TransportError>;

    fn write_data(&self, data: &[u8]) -> Result<(), TransportError>;

    fn read_public_key(&self) -> Result<Vec<u8>, TransportError>;

    fn write_public_key(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Drop the link. Idempotent.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Largest data write that fits in one ATT packet.
    fn chunk_size(&self) -> usize {
        self.att_mtu().saturating_sub(ATT_HEADER_SIZE).max(1)
    }

    /// Read and decode the control status byte.
    fn read_status(&self) -> Result<CtrlStatus, TransportError> {
        Ok(CtrlStatus::from_bytes(&self.read_ctrl()?))
    }

    fn send(&self, cmd: &CtrlCommand) -> Result<(), TransportError> {
        self.write_ctrl(&cmd.to_bytes())
    }
}

/// Opens a transport to a device.
///
/// Implementations connect, negotiate `requested_mtu` and discover the FOTA
/// service, failing with [`TransportError::ServiceNotFound`] when the
/// mandatory characteristics are missing.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        address: &DeviceAddress,
        requested_mtu: usize,
    ) -> Result<Arc<dyn FotaTransport>, TransportError>;
}

impl<F> Connector for F
where
    F: Fn(&DeviceAddress, usize) -> Result<Arc<dyn FotaTransport>, TransportError> + Send + Sync,
{
    fn connect(
        &self,
        address: &DeviceAddress,
        requested_mtu: usize,
    ) -> Result<Arc<dyn FotaTransport>, TransportError> {
        self(address, requested_mtu)
    }
}
