//! FOTA-Core: firmware-over-the-air update engine.
//!
//! Loads update packages, decides what to flash on a device and where, and
//! drives the FOTA GATT service through a complete update, optionally over
//! an encrypted and signed channel.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Package**: zip archive + `manifest.json` decoding
//! - **Plan**: version comparison, flash layout registry, metadata block
//! - **Crypto**: session keys, ECDSA/ECDH over P-256, keystream cipher
//! - **Protocol**: control opcodes and status codes
//! - **Transport**: device link abstraction (simulator included)
//! - **Events**: observer and dispatcher for UI decoupling
//! - **Session**: the update orchestrator
//! - **Online**: fetching the latest package from an update server
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fota_core::events::{ChannelObserver, FotaEvent};
//! use fota_core::plan::{build_plan, resolve_flash_layout};
//! use fota_core::session::{Updater, UpdaterConfig};
//! use fota_core::transport::{DeviceAddress, SimulatedConnector, SimulatedDevice};
//! use fota_core::{Package, ProductVersion};
//!
//! let package = Package::load_from_file("update.zip").expect("bad package");
//! let device = Arc::new(SimulatedDevice::new(ProductVersion::default()));
//! let (observer, events) = ChannelObserver::channel();
//! let updater = Updater::with_observer(
//!     DeviceAddress::new("C0:FF:EE:00:00:01"),
//!     Arc::new(SimulatedConnector::new(device)),
//!     UpdaterConfig::default(),
//!     Arc::new(observer),
//! );
//!
//! for event in events.iter() {
//!     if let FotaEvent::Ready { version } = event {
//!         let mut plan = build_plan(&package, &version);
//!         resolve_flash_layout(&mut plan, 0, false).expect("no layout");
//!         updater.begin_transfer(plan).expect("transfer refused");
//!     }
//!     if matches!(event, FotaEvent::Completed | FotaEvent::Failed { .. }) {
//!         break;
//!     }
//! }
//! ```

pub mod checksum;
pub mod crypto;
pub mod events;
pub mod handshake;
pub mod online;
pub mod package;
pub mod plan;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod version;

// Re-exports for convenience
pub use crypto::{CryptoError, SessionKeys};
pub use events::{
    ChannelObserver, Dispatcher, FailureCode, FotaEvent, FotaObserver, InlineDispatcher,
    NullObserver, QueueDispatcher, TracingObserver,
};
pub use handshake::HandshakeError;
pub use online::{LatestPackage, OnlineError, fetch_latest};
pub use package::{Package, PackageError, UpdateItem};
pub use plan::{
    FlashLayout, MetaData, Plan, PlanError, build_plan, resolve_flash_layout,
    resolve_flash_layout_with_top,
};
pub use protocol::{CtrlCommand, CtrlStatus};
pub use session::{UpdateError, Updater, UpdaterConfig};
pub use state::SessionState;
pub use transport::{Connector, DeviceAddress, FotaTransport, SimulatedDevice, TransportError};
pub use version::{ProductVersion, Version, VersionParseError};
