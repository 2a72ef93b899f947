//! Transport layer module.

pub mod mock;
pub mod traits;

pub use mock::{SimulatedConnector, SimulatedDevice};
pub use traits::{Connector, DeviceAddress, FotaTransport, TransportError};
