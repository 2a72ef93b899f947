//! In-memory FOTA peer for testing the orchestrator.
//!
//! `SimulatedDevice` speaks the control/data protocol in both plain and
//! secure mode, keeps written pages in a flash map and supports fault
//! injection.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::traits::{Connector, DeviceAddress, FotaTransport, TransportError};
use crate::checksum::crc16;
use crate::crypto::{self, PUBLIC_KEY_LEN, ROOT_PK, SessionKeys};
use crate::plan::MetaData;
use crate::protocol::{CtrlCommand, CtrlStatus, DEFAULT_ATT_MTU};
use crate::version::ProductVersion;

/// Largest ATT MTU the simulated radio accepts.
pub const SIMULATED_MAX_MTU: usize = 247;

#[derive(Debug, Default)]
struct Faults {
    unreachable: bool,
    no_service: bool,
    reject_start: bool,
    /// Data writes left to fail.
    failing_writes: usize,
    /// PAGE_END commands left to answer with ERROR.
    corrupt_pages: usize,
    /// WAIT_DATA reads served after every PAGE_END.
    busy_polls: usize,
    /// Drop the link once this many pages are committed.
    disconnect_after_pages: Option<usize>,
    /// Block data writes until released or disconnected.
    hold_data: bool,
}

#[derive(Debug)]
struct PageBuffer {
    addr: u32,
    data: Vec<u8>,
}

struct DeviceState {
    version: ProductVersion,
    secure: bool,
    root_pk: [u8; PUBLIC_KEY_LEN],
    keys: SessionKeys,
    host_pk: Option<[u8; PUBLIC_KEY_LEN]>,
    connected: bool,
    att_mtu: usize,
    status: CtrlStatus,
    pending_polls: usize,
    enabled: bool,
    page: Option<PageBuffer>,
    flash: BTreeMap<u32, Vec<u8>>,
    pages_committed: usize,
    metadata: Option<MetaData>,
    rebooted: bool,
    ctrl_log: Vec<Vec<u8>>,
    held_writers: usize,
    faults: Faults,
}

impl DeviceState {
    fn page_end(&mut self, size: u16, crc: u16, signature: Option<&[u8]>) -> CtrlStatus {
        let Some(page) = self.page.take() else {
            return CtrlStatus::Error;
        };
        if self.faults.corrupt_pages > 0 {
            self.faults.corrupt_pages -= 1;
            return CtrlStatus::Error;
        }
        if page.data.len() != usize::from(size) || crc16(&page.data) != crc {
            warn!(addr = %format!("0x{:08X}", page.addr), "Simulated device: page check failed");
            return CtrlStatus::Error;
        }

        let mut data = page.data;
        if self.secure {
            self.keys.encrypt(&mut data);
            let verified = match (signature, &self.host_pk) {
                (Some(sig), Some(pk)) => crypto::verify(pk, &data, sig).is_ok(),
                _ => false,
            };
            if !verified {
                warn!("Simulated device: page signature rejected");
                return CtrlStatus::Error;
            }
        }

        self.flash.insert(page.addr, data);
        self.pages_committed += 1;
        if self.faults.disconnect_after_pages == Some(self.pages_committed) {
            debug!("Simulated device: dropping link");
            self.connected = false;
        }
        self.pending_polls = self.faults.busy_polls;
        CtrlStatus::Ok
    }

    fn metadata(&mut self, block: Vec<u8>) -> CtrlStatus {
        match MetaData::from_bytes(&block) {
            Ok(meta) => {
                self.metadata = Some(meta);
                CtrlStatus::Ok
            }
            Err(e) => {
                warn!(error = %e, "Simulated device: bad metadata");
                CtrlStatus::Error
            }
        }
    }

    fn secure_metadata(&mut self, signature: &[u8], crc: u16, mut body: Vec<u8>) -> CtrlStatus {
        if crc16(&body) != crc {
            return CtrlStatus::Error;
        }
        self.keys.encrypt(&mut body);
        let verified = self
            .host_pk
            .is_some_and(|pk| crypto::verify(&pk, &body, signature).is_ok());
        if !verified {
            return CtrlStatus::Error;
        }
        let mut block = crc16(&body).to_le_bytes().to_vec();
        block.extend_from_slice(&body);
        self.metadata(block)
    }

    fn handle(&mut self, cmd: CtrlCommand) -> CtrlStatus {
        match cmd {
            CtrlCommand::Start => {
                if self.faults.reject_start || (self.secure && self.host_pk.is_none()) {
                    return CtrlStatus::Error;
                }
                self.enabled = true;
                CtrlStatus::Ok
            }
            _ if !self.enabled => CtrlStatus::Error,
            CtrlCommand::PageBegin { addr } => {
                self.page = Some(PageBuffer {
                    addr,
                    data: Vec::new(),
                });
                CtrlStatus::Ok
            }
            CtrlCommand::PageEnd {
                size,
                crc,
                signature,
            } => self.page_end(size, crc, signature.as_ref().map(|s| s.as_slice())),
            CtrlCommand::Metadata(block) => self.metadata(block),
            CtrlCommand::SecureMetadata {
                signature,
                crc,
                body,
            } => self.secure_metadata(&signature, crc, body),
            CtrlCommand::ReadPage { .. } | CtrlCommand::SwitchApp => CtrlStatus::Ok,
            CtrlCommand::Reboot => {
                self.rebooted = true;
                self.connected = false;
                CtrlStatus::Disabled
            }
        }
    }
}

/// Simulated FOTA peripheral.
pub struct SimulatedDevice {
    state: Mutex<DeviceState>,
    wake: Condvar,
}

impl SimulatedDevice {
    /// Device accepting plain transfers.
    pub fn new(version: ProductVersion) -> Self {
        Self::build(version, false)
    }

    /// Device exposing the public-key characteristic.
    pub fn new_secure(version: ProductVersion) -> Self {
        Self::build(version, true)
    }

    fn build(version: ProductVersion, secure: bool) -> Self {
        Self {
            state: Mutex::new(DeviceState {
                version,
                secure,
                root_pk: ROOT_PK,
                keys: SessionKeys::generate(),
                host_pk: None,
                connected: false,
                att_mtu: DEFAULT_ATT_MTU,
                status: CtrlStatus::Disabled,
                pending_polls: 0,
                enabled: false,
                page: None,
                flash: BTreeMap::new(),
                pages_committed: 0,
                metadata: None,
                rebooted: false,
                ctrl_log: Vec::new(),
                held_writers: 0,
                faults: Faults::default(),
            }),
            wake: Condvar::new(),
        }
    }

    /// Trust a different root key than the host signs with.
    pub fn with_root_pk(self, root_pk: [u8; PUBLIC_KEY_LEN]) -> Self {
        self.state.lock().root_pk = root_pk;
        self
    }

    /// Accept the connection and negotiate the MTU.
    pub fn attach(&self, requested_mtu: usize) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        if st.faults.unreachable {
            return Err(TransportError::ConnectFailed("simulated device".into()));
        }
        if st.faults.no_service {
            return Err(TransportError::ServiceNotFound);
        }
        st.att_mtu = requested_mtu.clamp(DEFAULT_ATT_MTU, SIMULATED_MAX_MTU);
        st.connected = true;
        Ok(())
    }

    pub fn set_unreachable(&self) {
        self.state.lock().faults.unreachable = true;
    }

    pub fn remove_service(&self) {
        self.state.lock().faults.no_service = true;
    }

    pub fn reject_start(&self) {
        self.state.lock().faults.reject_start = true;
    }

    pub fn fail_data_writes(&self, count: usize) {
        self.state.lock().faults.failing_writes = count;
    }

    pub fn corrupt_pages(&self, count: usize) {
        self.state.lock().faults.corrupt_pages = count;
    }

    pub fn busy_polls(&self, count: usize) {
        self.state.lock().faults.busy_polls = count;
    }

    pub fn disconnect_after_pages(&self, pages: usize) {
        self.state.lock().faults.disconnect_after_pages = Some(pages);
    }

    pub fn hold_data_writes(&self) {
        self.state.lock().faults.hold_data = true;
    }

    pub fn release_data_writes(&self) {
        self.state.lock().faults.hold_data = false;
        self.wake.notify_all();
    }

    /// Number of data writes currently blocked by [`hold_data_writes`](Self::hold_data_writes).
    pub fn held_writers(&self) -> usize {
        self.state.lock().held_writers
    }

    /// Read back flash starting at a page address, following consecutive pages.
    pub fn read_flash(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        let st = self.state.lock();
        let mut out = Vec::with_capacity(len);
        let mut cur = addr;
        while out.len() < len {
            let page = st.flash.get(&cur)?;
            let take = page.len().min(len - out.len());
            out.extend_from_slice(&page[..take]);
            cur = cur.checked_add(u32::try_from(page.len()).ok()?)?;
        }
        Some(out)
    }

    pub fn pages_committed(&self) -> usize {
        self.state.lock().pages_committed
    }

    pub fn metadata(&self) -> Option<MetaData> {
        self.state.lock().metadata.clone()
    }

    pub fn rebooted(&self) -> bool {
        self.state.lock().rebooted
    }

    pub fn is_secure(&self) -> bool {
        self.state.lock().secure
    }

    /// Session key the host presented, once the handshake passed.
    pub fn host_public_key(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.state.lock().host_pk
    }

    /// Captured control writes.
    pub fn ctrl_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().ctrl_log.clone()
    }

    fn check_link(st: &DeviceState) -> Result<(), TransportError> {
        if st.connected {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

impl FotaTransport for SimulatedDevice {
    fn att_mtu(&self) -> usize {
        self.state.lock().att_mtu
    }

    fn has_secure_channel(&self) -> bool {
        self.state.lock().secure
    }

    fn read_version(&self) -> Result<Vec<u8>, TransportError> {
        let st = self.state.lock();
        Self::check_link(&st)?;
        let mut out = Vec::with_capacity(ProductVersion::WIRE_SIZE);
        for v in [st.version.platform, st.version.app] {
            out.extend_from_slice(&(v.major as u16).to_le_bytes());
            out.push(v.minor as u8);
            out.push(v.patch as u8);
        }
        Ok(out)
    }

    fn read_ctrl(&self) -> Result<Vec<u8>, TransportError> {
        let mut st = self.state.lock();
        Self::check_link(&st)?;
        if st.pending_polls > 0 {
            st.pending_polls -= 1;
            return Ok(vec![CtrlStatus::WaitData.to_byte()]);
        }
        Ok(vec![st.status.to_byte()])
    }

    fn write_ctrl(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        Self::check_link(&st)?;
        st.ctrl_log.push(data.to_vec());
        let status = match CtrlCommand::parse(data, st.secure) {
            Ok(cmd) => st.handle(cmd),
            Err(e) => {
                warn!(error = %e, "Simulated device: bad control write");
                CtrlStatus::Error
            }
        };
        st.status = status;
        Ok(())
    }

    fn write_data(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        while st.faults.hold_data && st.connected {
            st.held_writers += 1;
            self.wake.wait(&mut st);
            st.held_writers -= 1;
        }
        Self::check_link(&st)?;
        if st.faults.failing_writes > 0 {
            st.faults.failing_writes -= 1;
            return Err(TransportError::WriteFailed("injected".into()));
        }
        if data.len() > st.att_mtu.saturating_sub(3) {
            return Err(TransportError::WriteFailed(format!(
                "{} bytes exceed MTU {}",
                data.len(),
                st.att_mtu
            )));
        }
        match st.page.as_mut() {
            Some(page) => page.data.extend_from_slice(data),
            None => st.status = CtrlStatus::Error,
        }
        Ok(())
    }

    fn read_public_key(&self) -> Result<Vec<u8>, TransportError> {
        let st = self.state.lock();
        Self::check_link(&st)?;
        if !st.secure {
            return Err(TransportError::CharacteristicNotFound("public key"));
        }
        Ok(st.keys.session_pk().to_vec())
    }

    fn write_public_key(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        Self::check_link(&st)?;
        if !st.secure {
            return Err(TransportError::CharacteristicNotFound("public key"));
        }
        let (pk, sig) = data.split_at(data.len().min(PUBLIC_KEY_LEN));
        let accepted = pk.len() == PUBLIC_KEY_LEN
            && crypto::verify(&st.root_pk, pk, sig).is_ok()
            && st.keys.establish(pk).is_ok();
        if accepted {
            let mut host = [0u8; PUBLIC_KEY_LEN];
            host.copy_from_slice(pk);
            st.host_pk = Some(host);
            st.status = CtrlStatus::Ok;
        } else {
            warn!("Simulated device: session key rejected");
            st.status = CtrlStatus::Error;
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.state.lock().connected = false;
        self.wake.notify_all();
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

/// Connects every address to one shared [`SimulatedDevice`].
pub struct SimulatedConnector {
    device: Arc<SimulatedDevice>,
}

impl SimulatedConnector {
    pub fn new(device: Arc<SimulatedDevice>) -> Self {
        Self { device }
    }
}

impl Connector for SimulatedConnector {
    fn connect(
        &self,
        address: &DeviceAddress,
        requested_mtu: usize,
    ) -> Result<Arc<dyn FotaTransport>, TransportError> {
        debug!(address = %address, requested_mtu, "Simulated connect");
        self.device.attach(requested_mtu)?;
        Ok(self.device.clone())
    }
}
