//! Update session - drives one device from connect to reboot.
//!
//! An [`Updater`] owns a background worker thread. Construction starts the
//! worker, which connects, reads the device version and (on secure devices)
//! exchanges session keys. Once [`FotaEvent::Ready`] has fired, the caller
//! hands a resolved [`Plan`] to [`Updater::begin_transfer`].
//!
//! Callbacks are scheduled through the session's [`Dispatcher`]. Every job
//! re-checks the abort flag under the delivery gate before it touches the
//! observer, so nothing is delivered once [`Updater::abort`] has returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::checksum::crc16;
use crate::crypto::SessionKeys;
use crate::events::{
    Dispatcher, FailureCode, FotaEvent, FotaObserver, InlineDispatcher, TracingObserver,
};
use crate::handshake;
use crate::package::UpdateItem;
use crate::plan::{Plan, PlanError};
use crate::protocol::{
    CtrlCommand, DEFAULT_REQUESTED_MTU, MAX_RETRY, SERVICE_NAME, WAIT_BETWEEN_MTU_MS,
    WAIT_BETWEEN_PAGE_MS,
};
use crate::state::{SessionMachine, SessionState};
use crate::transport::{Connector, DeviceAddress, FotaTransport, TransportError};
use crate::version::ProductVersion;

/// Configuration for an update session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// ATT MTU requested on connect.
    pub requested_mtu: usize,
    /// Attempts per page before the transfer fails.
    pub max_page_retries: u32,
    /// Pause after each data write.
    pub mtu_interval_ms: u64,
    /// Pause between PAGE_END and the first status poll.
    pub page_interval_ms: u64,
    /// Status reads allowed while waiting for a page to commit.
    pub status_poll_limit: u32,
    /// Flash layout registry index.
    pub chip_family: usize,
    /// Allocate from this address instead of the top of the flash window.
    pub flash_top: Option<u32>,
    /// Update server for online delivery.
    pub server: Option<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            requested_mtu: DEFAULT_REQUESTED_MTU,
            max_page_retries: MAX_RETRY,
            mtu_interval_ms: WAIT_BETWEEN_MTU_MS,
            page_interval_ms: WAIT_BETWEEN_PAGE_MS,
            status_poll_limit: 1000,
            chip_family: 0,
            flash_top: None,
            server: None,
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: UpdaterConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Caller errors from [`Updater::begin_transfer`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Session is not ready (state: {0})")]
    NotReady(SessionState),
    #[error("A transfer is already in progress")]
    TransferInProgress,
    #[error("Session was aborted")]
    Aborted,
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
}

enum Command {
    Transfer(Box<Plan>),
}

/// Why the worker stopped early.
enum Stop {
    /// Abort was requested; report nothing.
    Aborted,
    Failed {
        code: FailureCode,
        message: String,
        source: anyhow::Error,
    },
}

impl Stop {
    fn failed(
        code: FailureCode,
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Stop::Failed {
            code,
            message: message.into(),
            source: source.into(),
        }
    }
}

trait OrFail<T> {
    fn or_fail(self, code: FailureCode, message: &str) -> Result<T, Stop>;
}

impl<T, E: Into<anyhow::Error>> OrFail<T> for Result<T, E> {
    fn or_fail(self, code: FailureCode, message: &str) -> Result<T, Stop> {
        self.map_err(|e| Stop::failed(code, message, e))
    }
}

/// State shared between the handle and the worker thread.
struct Shared<O> {
    observer: Arc<O>,
    dispatcher: Arc<dyn Dispatcher>,
    /// Held while delivering a callback and while abort flips the flag.
    gate: ReentrantMutex<()>,
    aborted: AtomicBool,
    transfer_requested: AtomicBool,
    machine: Mutex<SessionMachine>,
    transport: Mutex<Option<Arc<dyn FotaTransport>>>,
    device_version: Mutex<Option<ProductVersion>>,
}

impl<O: FotaObserver + 'static> Shared<O> {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn check_aborted(&self) -> Result<(), Stop> {
        if self.is_aborted() {
            Err(Stop::Aborted)
        } else {
            Ok(())
        }
    }

    fn emit(self: &Arc<Self>, event: FotaEvent) {
        if self.is_aborted() {
            return;
        }
        let shared = Arc::clone(self);
        self.dispatcher.dispatch(Box::new(move || {
            let _gate = shared.gate.lock();
            if !shared.is_aborted() {
                shared.observer.on_event(&event);
            }
        }));
    }

    fn message(self: &Arc<Self>, text: impl Into<String>) {
        self.emit(FotaEvent::message(text));
    }

    fn goto(self: &Arc<Self>, to: SessionState) -> Result<(), Stop> {
        let from = {
            let _gate = self.gate.lock();
            self.check_aborted()?;
            self.machine
                .lock()
                .goto_state(to)
                .or_fail(FailureCode::Internal, "internal state error")?
        };
        self.emit(FotaEvent::StateChanged { from, to });
        Ok(())
    }

    /// Publish the transport so abort can reach it.
    fn attach(&self, transport: Arc<dyn FotaTransport>) -> Result<(), Stop> {
        let _gate = self.gate.lock();
        if self.is_aborted() {
            transport.disconnect();
            return Err(Stop::Aborted);
        }
        *self.transport.lock() = Some(transport);
        Ok(())
    }

    fn release_transport(&self) {
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.disconnect();
        }
    }
}

/// Per-session work running on the background thread.
struct Worker<O> {
    shared: Arc<Shared<O>>,
    config: UpdaterConfig,
    keys: SessionKeys,
    transport: Option<Arc<dyn FotaTransport>>,
    secure: bool,
    total_bytes: usize,
    current_bytes: usize,
}

impl<O: FotaObserver + 'static> Worker<O> {
    fn new(shared: Arc<Shared<O>>, config: UpdaterConfig) -> Self {
        Self {
            shared,
            config,
            keys: SessionKeys::generate(),
            transport: None,
            secure: false,
            total_bytes: 0,
            current_bytes: 0,
        }
    }

    fn run(
        mut self,
        address: DeviceAddress,
        connector: Arc<dyn Connector>,
        commands: mpsc::Receiver<Command>,
    ) {
        if let Err(stop) = self.prepare(&address, connector.as_ref()) {
            self.stop(stop);
            return;
        }

        match commands.recv() {
            Ok(Command::Transfer(plan)) => {
                if let Err(stop) = self.transfer(&plan) {
                    self.stop(stop);
                }
            }
            Err(_) => debug!("Command channel closed"),
        }
    }

    fn link(&self) -> Result<Arc<dyn FotaTransport>, Stop> {
        self.transport.clone().ok_or(Stop::Aborted)
    }

    #[instrument(skip_all, fields(address = %address))]
    fn prepare(&mut self, address: &DeviceAddress, connector: &dyn Connector) -> Result<(), Stop> {
        self.shared.goto(SessionState::Connecting)?;
        self.shared.message(format!("connecting to {address} ..."));

        let transport = match connector.connect(address, self.config.requested_mtu) {
            Ok(transport) => transport,
            Err(e @ TransportError::ServiceNotFound) => {
                return Err(Stop::failed(
                    FailureCode::ServiceUnavailable,
                    format!("{SERVICE_NAME} is not available"),
                    e,
                ));
            }
            Err(e) => return Err(Stop::failed(FailureCode::ConnectFailed, "connection failed", e)),
        };
        self.shared.attach(transport.clone())?;
        self.transport = Some(transport.clone());
        info!(att_mtu = transport.att_mtu(), chunk = transport.chunk_size(), "Connected");

        self.secure = transport.has_secure_channel();
        self.shared.emit(FotaEvent::SecureStatus {
            secure: self.secure,
        });
        self.shared
            .message(if self.secure { "Secure FOTA" } else { "Unsecure FOTA" });
        self.shared.message(format!("{SERVICE_NAME} discovered."));

        self.shared.goto(SessionState::VersionQuery)?;
        self.shared.message("query current version ...");
        let raw = transport
            .read_version()
            .or_fail(FailureCode::VersionQueryFailed, "failed to query version")?;
        let version = ProductVersion::from_wire(&raw)
            .or_fail(FailureCode::VersionQueryFailed, "failed to query version")?;
        info!(version = %version, "Device version");

        if self.secure {
            self.shared.goto(SessionState::SecureHandshake)?;
            self.shared.message("exchange session key ...");
            handshake::exchange_keys(transport.as_ref(), &mut self.keys).or_fail(
                FailureCode::HandshakeFailed,
                "failed to exchange session key",
            )?;
        } else {
            self.shared.goto(SessionState::PlainReady)?;
        }

        *self.shared.device_version.lock() = Some(version);
        self.shared.goto(SessionState::Ready)?;
        self.shared.message("version confirmed");
        self.shared.emit(FotaEvent::Ready { version });
        Ok(())
    }

    #[instrument(skip_all, fields(items = plan.items.len(), secure = self.secure))]
    fn transfer(&mut self, plan: &Plan) -> Result<(), Stop> {
        self.shared.goto(SessionState::Transferring)?;
        let transport = self.link()?;
        self.total_bytes = plan.total_bytes();
        self.current_bytes = 0;

        self.shared.message("enabling FOTA");
        self.enable(transport.as_ref())
            .or_fail(FailureCode::EnableFailed, "failed to enable FOTA")?;
        self.shared.message("FOTA successfully enabled");

        for item in &plan.items {
            self.burn_file(transport.as_ref(), item, plan.page_size)?;
        }

        let meta = plan
            .meta_data
            .as_ref()
            .ok_or(PlanError::Unresolved)
            .or_fail(FailureCode::MetadataFailed, "metadata failed")?;
        self.burn_metadata(transport.as_ref(), meta, plan.manual_reboot)
            .or_fail(FailureCode::MetadataFailed, "metadata failed")?;

        self.shared.message("FOTA burn complete, reboot...");
        if plan.manual_reboot {
            // The device resets on REBOOT, so the write may not be acknowledged.
            if let Err(e) = transport.send(&CtrlCommand::Reboot) {
                debug!(error = %e, "Reboot write");
            }
        }
        self.shared.release_transport();
        self.shared.goto(SessionState::Completed)?;
        self.shared.emit(FotaEvent::Completed);
        info!(bytes = self.total_bytes, "Transfer complete");
        Ok(())
    }

    fn enable(&self, transport: &dyn FotaTransport) -> Result<()> {
        transport.send(&CtrlCommand::Start)?;
        expect_ok(transport)
    }

    fn burn_file(
        &mut self,
        transport: &dyn FotaTransport,
        item: &UpdateItem,
        page_size: u32,
    ) -> Result<(), Stop> {
        let base = item
            .write_addr
            .ok_or(PlanError::Unresolved)
            .or_fail(FailureCode::BurnFailed, "burn failed")?;
        let page_size = usize::try_from(page_size)
            .ok()
            .filter(|&s| s > 0)
            .ok_or(PlanError::Unresolved)
            .or_fail(FailureCode::BurnFailed, "burn failed")?;
        let max_attempts = self.config.max_page_retries.max(1);

        for (index, page) in item.data.chunks(page_size).enumerate() {
            let addr = base + (index * page_size) as u32;
            let backup = self.current_bytes;
            let mut attempt = 0;
            loop {
                self.shared.message(if attempt == 0 {
                    format!("burn {} ...", item.name)
                } else {
                    format!("burn {} (retry #{attempt}) ...", item.name)
                });
                match self.burn_page(transport, page, addr) {
                    Ok(()) => break,
                    Err(e) => {
                        self.shared.check_aborted()?;
                        attempt += 1;
                        warn!(
                            name = %item.name,
                            addr = %format!("0x{addr:08X}"),
                            attempt,
                            error = %format!("{e:#}"),
                            "Page failed"
                        );
                        self.set_current_bytes(backup);
                        if attempt >= max_attempts || !transport.is_connected() {
                            return Err(Stop::failed(FailureCode::BurnFailed, "burn failed", e));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn burn_page(&mut self, transport: &dyn FotaTransport, page: &[u8], addr: u32) -> Result<()> {
        // Encrypt a fresh copy on every attempt; the signature covers the plaintext.
        let mut wire = page.to_vec();
        let signature = if self.secure {
            let signature = self.keys.sign(page)?;
            self.keys.encrypt(&mut wire);
            Some(signature)
        } else {
            None
        };
        let size = u16::try_from(wire.len()).context("page does not fit PAGE_END")?;
        let crc = crc16(&wire);

        transport.send(&CtrlCommand::PageBegin { addr })?;
        expect_ok(transport).context("PAGE_BEGIN")?;

        for chunk in wire.chunks(transport.chunk_size()) {
            transport.write_data(chunk)?;
            self.set_current_bytes(self.current_bytes + chunk.len());
            pace(self.config.mtu_interval_ms);
        }

        transport.send(&CtrlCommand::PageEnd {
            size,
            crc,
            signature,
        })?;
        pace(self.config.page_interval_ms);

        for _ in 0..self.config.status_poll_limit.max(1) {
            let status = transport.read_status()?;
            if status.is_final() {
                if status.is_ok() {
                    return Ok(());
                }
                bail!("device rejected page at 0x{addr:08X}");
            }
        }
        bail!("page at 0x{addr:08X} not committed after {} polls", self.config.status_poll_limit)
    }

    fn burn_metadata(
        &mut self,
        transport: &dyn FotaTransport,
        item: &UpdateItem,
        manual_reboot: bool,
    ) -> Result<()> {
        self.shared.message(format!("burn {}", item.name));

        let cmd = if self.secure {
            let plain = item.data.get(2..).context("metadata block too short")?;
            let signature = self.keys.sign(plain)?;
            let mut body = plain.to_vec();
            self.keys.encrypt(&mut body);
            CtrlCommand::SecureMetadata {
                signature,
                crc: crc16(&body),
                body,
            }
        } else {
            CtrlCommand::Metadata(item.data.to_vec())
        };

        transport.send(&cmd)?;
        if manual_reboot {
            expect_ok(transport).context("METADATA")?;
        }
        Ok(())
    }

    fn set_current_bytes(&mut self, value: usize) {
        self.current_bytes = value;
        let percent = if self.total_bytes == 0 {
            100
        } else {
            (100 * value as u64 / self.total_bytes as u64).min(100) as u8
        };
        self.shared.emit(FotaEvent::percent(percent));
    }

    fn stop(&self, stop: Stop) {
        let Stop::Failed {
            code,
            message,
            source,
        } = stop
        else {
            debug!("Session stopped by abort");
            return;
        };
        if self.shared.is_aborted() {
            debug!(error = %format!("{source:#}"), "Ignoring failure after abort");
            return;
        }

        warn!(code = %code, error = %format!("{source:#}"), "{}", message);
        let _ = self.shared.goto(SessionState::Failed);
        self.shared.message(message.clone());
        self.shared.emit(FotaEvent::Failed { code, message });
        self.shared.release_transport();
    }
}

fn expect_ok(transport: &dyn FotaTransport) -> Result<()> {
    let status = transport.read_status()?;
    if !status.is_ok() {
        bail!("device status {status}");
    }
    Ok(())
}

fn pace(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// One device-update session.
pub struct Updater<O: FotaObserver + 'static> {
    address: DeviceAddress,
    shared: Arc<Shared<O>>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Updater<TracingObserver> {
    /// Start a session that logs events with tracing.
    pub fn new(
        address: DeviceAddress,
        connector: Arc<dyn Connector>,
        config: UpdaterConfig,
    ) -> Self {
        Self::with_observer(address, connector, config, Arc::new(TracingObserver))
    }
}

impl<O: FotaObserver + 'static> Updater<O> {
    /// Start a session delivering events inline on the worker thread.
    pub fn with_observer(
        address: DeviceAddress,
        connector: Arc<dyn Connector>,
        config: UpdaterConfig,
        observer: Arc<O>,
    ) -> Self {
        Self::with_dispatcher(address, connector, config, observer, Arc::new(InlineDispatcher))
    }

    /// Start a session delivering events through `dispatcher`.
    pub fn with_dispatcher(
        address: DeviceAddress,
        connector: Arc<dyn Connector>,
        config: UpdaterConfig,
        observer: Arc<O>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let shared = Arc::new(Shared {
            observer,
            dispatcher,
            gate: ReentrantMutex::new(()),
            aborted: AtomicBool::new(false),
            transfer_requested: AtomicBool::new(false),
            machine: Mutex::new(SessionMachine::new()),
            transport: Mutex::new(None),
            device_version: Mutex::new(None),
        });

        let (tx, rx) = mpsc::channel();
        let worker = Worker::new(Arc::clone(&shared), config);
        let target = address.clone();
        let handle = thread::spawn(move || worker.run(target, connector, rx));

        Self {
            address,
            shared,
            commands: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.shared.machine.lock().state()
    }

    /// Version reported by the device; `Some` once the session is ready.
    pub fn device_version(&self) -> Option<ProductVersion> {
        *self.shared.device_version.lock()
    }

    /// Hand a resolved plan to the worker. Only one transfer per session.
    pub fn begin_transfer(&self, plan: Plan) -> Result<(), UpdateError> {
        if self.shared.is_aborted() {
            return Err(UpdateError::Aborted);
        }
        if !plan.is_resolved() {
            return Err(PlanError::Unresolved.into());
        }
        match self.state() {
            SessionState::Ready => {}
            SessionState::Transferring => return Err(UpdateError::TransferInProgress),
            other => return Err(UpdateError::NotReady(other)),
        }
        if self.shared.transfer_requested.swap(true, Ordering::SeqCst) {
            return Err(UpdateError::TransferInProgress);
        }

        let sent = self
            .commands
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Transfer(Box::new(plan))).is_ok());
        if !sent {
            return Err(UpdateError::Aborted);
        }
        info!(address = %self.address, "Transfer requested");
        Ok(())
    }

    /// Cancel the session and release the transport. Idempotent; safe to
    /// call from any thread, including from inside a callback.
    pub fn abort(&self) {
        let transport = {
            let _gate = self.shared.gate.lock();
            if self.shared.aborted.swap(true, Ordering::SeqCst) {
                return;
            }
            let mut machine = self.shared.machine.lock();
            let state = machine.state();
            if state != SessionState::Disconnected && !state.is_terminal() {
                let _ = machine.goto_state(SessionState::Disconnected);
            }
            self.shared.transport.lock().take()
        };
        if let Some(transport) = transport {
            transport.disconnect();
        }
        self.commands.lock().take();
        info!(address = %self.address, "Session aborted");
    }

    /// Block until the worker thread exits.
    ///
    /// The worker only exits after a transfer, a failure or an abort.
    pub fn wait(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Session worker panicked");
            }
        }
    }
}

impl<O: FotaObserver + 'static> Drop for Updater<O> {
    fn drop(&mut self) {
        self.abort();
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelObserver, NullObserver, QueueDispatcher};
    use crate::package::Package;
    use crate::package::tests::sample_archive;
    use crate::plan::{MetaData, build_plan, resolve_flash_layout};
    use crate::transport::{SimulatedConnector, SimulatedDevice};
    use crate::version::Version;
    use std::sync::Weak;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn fast_config() -> UpdaterConfig {
        UpdaterConfig {
            mtu_interval_ms: 0,
            page_interval_ms: 0,
            ..Default::default()
        }
    }

    fn old_device() -> ProductVersion {
        ProductVersion::new(Version::new(1, 1, 0), Version::new(2, 0, 0))
    }

    fn start(
        device: &Arc<SimulatedDevice>,
    ) -> (Updater<ChannelObserver>, mpsc::Receiver<FotaEvent>) {
        let (observer, rx) = ChannelObserver::channel();
        let updater = Updater::with_observer(
            DeviceAddress::new("C0:FF:EE:00:00:01"),
            Arc::new(SimulatedConnector::new(Arc::clone(device))),
            fast_config(),
            Arc::new(observer),
        );
        (updater, rx)
    }

    /// Collect events until `done` matches one.
    fn collect_until(
        rx: &mpsc::Receiver<FotaEvent>,
        done: impl Fn(&FotaEvent) -> bool,
    ) -> Vec<FotaEvent> {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv_timeout(TIMEOUT).expect("timed out waiting for event");
            let stop = done(&event);
            seen.push(event);
            if stop {
                return seen;
            }
        }
    }

    fn is_ready(e: &FotaEvent) -> bool {
        matches!(e, FotaEvent::Ready { .. })
    }

    fn is_final(e: &FotaEvent) -> bool {
        matches!(e, FotaEvent::Completed | FotaEvent::Failed { .. })
    }

    fn messages(events: &[FotaEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                FotaEvent::Progress {
                    message: Some(m), ..
                } => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn plan_for(version: &ProductVersion, chip_family: usize) -> Plan {
        let package = Package::load_from_archive(&sample_archive()).unwrap();
        let mut plan = build_plan(&package, version);
        resolve_flash_layout(&mut plan, chip_family, false).unwrap();
        plan
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < TIMEOUT, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn assert_flashed(device: &SimulatedDevice, plan: &Plan) {
        for item in &plan.items {
            let stored = device
                .read_flash(item.write_addr.unwrap(), item.len())
                .unwrap_or_else(|| panic!("{} not in flash", item.name));
            assert_eq!(stored, &item.data[..], "{}", item.name);
        }
        let meta = MetaData::from_bytes(&plan.meta_data.as_ref().unwrap().data).unwrap();
        assert_eq!(device.metadata(), Some(meta));
    }

    #[test]
    fn test_plain_update() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        let (updater, rx) = start(&device);

        let prepared = collect_until(&rx, is_ready);
        assert!(prepared.contains(&FotaEvent::SecureStatus { secure: false }));
        assert!(prepared.contains(&FotaEvent::Ready {
            version: old_device()
        }));
        assert_eq!(
            messages(&prepared)[..2],
            ["connecting to C0:FF:EE:00:00:01 ...", "Unsecure FOTA"]
        );
        assert_eq!(updater.state(), SessionState::Ready);
        assert_eq!(updater.device_version(), Some(old_device()));

        let plan = plan_for(&old_device(), 0);
        updater.begin_transfer(plan.clone()).unwrap();
        let transfer = collect_until(&rx, is_final);
        assert_eq!(transfer.last(), Some(&FotaEvent::Completed));

        let msgs = messages(&transfer);
        assert!(msgs.contains(&"FOTA successfully enabled".to_string()));
        assert!(msgs.contains(&"burn platform.bin ...".to_string()));
        assert!(msgs.contains(&"burn metadata".to_string()));
        assert!(msgs.contains(&"FOTA burn complete, reboot...".to_string()));

        let percents: Vec<u8> = transfer
            .iter()
            .filter_map(|e| match e {
                FotaEvent::Progress { percent, .. } => *percent,
                _ => None,
            })
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last(), Some(&100));

        assert_flashed(&device, &plan);
        assert!(device.rebooted());
        assert!(!device.is_connected());
        assert_eq!(updater.state(), SessionState::Completed);
        assert_eq!(
            updater.begin_transfer(plan),
            Err(UpdateError::NotReady(SessionState::Completed))
        );
    }

    #[test]
    fn test_secure_update() {
        let device = Arc::new(SimulatedDevice::new_secure(old_device()));
        let (updater, rx) = start(&device);

        let prepared = collect_until(&rx, is_ready);
        assert!(prepared.contains(&FotaEvent::SecureStatus { secure: true }));
        assert!(messages(&prepared).contains(&"exchange session key ...".to_string()));
        assert!(prepared.contains(&FotaEvent::StateChanged {
            from: SessionState::VersionQuery,
            to: SessionState::SecureHandshake,
        }));

        let plan = plan_for(&old_device(), 0);
        updater.begin_transfer(plan.clone()).unwrap();
        assert_eq!(collect_until(&rx, is_final).last(), Some(&FotaEvent::Completed));
        assert_flashed(&device, &plan);
    }

    #[test]
    fn test_automatic_reboot_family() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        let (updater, rx) = start(&device);
        collect_until(&rx, is_ready);

        let plan = plan_for(&old_device(), 1);
        assert!(!plan.manual_reboot);
        updater.begin_transfer(plan.clone()).unwrap();
        assert_eq!(collect_until(&rx, is_final).last(), Some(&FotaEvent::Completed));
        assert_flashed(&device, &plan);
        assert!(!device.rebooted());
        assert!(!device.ctrl_writes().contains(&CtrlCommand::Reboot.to_bytes()));
    }

    #[test]
    fn test_update_without_observer() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        let updater = Updater::with_observer(
            DeviceAddress::new("C0:FF:EE:00:00:05"),
            Arc::new(SimulatedConnector::new(Arc::clone(&device))),
            fast_config(),
            Arc::new(NullObserver),
        );
        wait_until(|| updater.state() == SessionState::Ready);

        let plan = plan_for(&old_device(), 0);
        updater.begin_transfer(plan.clone()).unwrap();
        wait_until(|| updater.state().is_terminal());
        assert_eq!(updater.state(), SessionState::Completed);
        assert_flashed(&device, &plan);
    }

    #[test]
    fn test_page_retry_recovers() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        device.corrupt_pages(2);
        device.busy_polls(3);
        let (updater, rx) = start(&device);
        collect_until(&rx, is_ready);

        let plan = plan_for(&old_device(), 0);
        updater.begin_transfer(plan.clone()).unwrap();
        let events = collect_until(&rx, is_final);
        assert_eq!(events.last(), Some(&FotaEvent::Completed));
        let msgs = messages(&events);
        assert!(msgs.contains(&"burn platform.bin (retry #1) ...".to_string()));
        assert!(msgs.contains(&"burn platform.bin (retry #2) ...".to_string()));
        assert_flashed(&device, &plan);
    }

    #[test]
    fn test_burn_failure_after_retries() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        device.corrupt_pages(3);
        let (updater, rx) = start(&device);
        collect_until(&rx, is_ready);

        updater.begin_transfer(plan_for(&old_device(), 0)).unwrap();
        let events = collect_until(&rx, is_final);
        assert_eq!(
            events.last(),
            Some(&FotaEvent::Failed {
                code: FailureCode::BurnFailed,
                message: "burn failed".into()
            })
        );
        assert!(messages(&events).contains(&"burn failed".to_string()));
        assert_eq!(updater.state(), SessionState::Failed);
        assert!(!device.is_connected());
    }

    #[test]
    fn test_data_write_failure_is_retried() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        device.fail_data_writes(1);
        let (updater, rx) = start(&device);
        collect_until(&rx, is_ready);

        updater.begin_transfer(plan_for(&old_device(), 0)).unwrap();
        assert_eq!(collect_until(&rx, is_final).last(), Some(&FotaEvent::Completed));
    }

    #[test]
    fn test_link_loss_fails_transfer() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        device.disconnect_after_pages(1);
        let (updater, rx) = start(&device);
        collect_until(&rx, is_ready);

        updater.begin_transfer(plan_for(&old_device(), 0)).unwrap();
        let last = collect_until(&rx, is_final).pop();
        assert!(matches!(
            last,
            Some(FotaEvent::Failed {
                code: FailureCode::BurnFailed,
                ..
            })
        ));
    }

    #[test]
    fn test_enable_rejected() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        device.reject_start();
        let (updater, rx) = start(&device);
        collect_until(&rx, is_ready);

        updater.begin_transfer(plan_for(&old_device(), 0)).unwrap();
        assert_eq!(
            collect_until(&rx, is_final).last(),
            Some(&FotaEvent::Failed {
                code: FailureCode::EnableFailed,
                message: "failed to enable FOTA".into()
            })
        );
    }

    #[test]
    fn test_connect_failure() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        device.set_unreachable();
        let (updater, rx) = start(&device);

        let events = collect_until(&rx, is_final);
        assert!(!events.iter().any(is_ready));
        assert_eq!(
            events.last(),
            Some(&FotaEvent::Failed {
                code: FailureCode::ConnectFailed,
                message: "connection failed".into()
            })
        );
        updater.wait();
        assert_eq!(updater.state(), SessionState::Failed);
        assert_eq!(updater.device_version(), None);
    }

    #[test]
    fn test_missing_service() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        device.remove_service();
        let (_updater, rx) = start(&device);
        assert_eq!(
            collect_until(&rx, is_final).last(),
            Some(&FotaEvent::Failed {
                code: FailureCode::ServiceUnavailable,
                message: "INGChips FOTA Service is not available".into()
            })
        );
    }

    #[test]
    fn test_handshake_rejected() {
        let other_root = crate::crypto::public_key_of(&[9u8; 32]).unwrap();
        let device = Arc::new(SimulatedDevice::new_secure(old_device()).with_root_pk(other_root));
        let (updater, rx) = start(&device);

        let events = collect_until(&rx, is_final);
        assert!(!events.iter().any(is_ready));
        assert_eq!(
            events.last(),
            Some(&FotaEvent::Failed {
                code: FailureCode::HandshakeFailed,
                message: "failed to exchange session key".into()
            })
        );
        updater.wait();
        assert!(!device.is_connected());
    }

    #[test]
    fn test_begin_transfer_caller_errors() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        device.hold_data_writes();
        let (updater, rx) = start(&device);
        collect_until(&rx, is_ready);

        let package = Package::load_from_archive(&sample_archive()).unwrap();
        let unresolved = build_plan(&package, &old_device());
        assert_eq!(
            updater.begin_transfer(unresolved),
            Err(UpdateError::Plan(PlanError::Unresolved))
        );

        updater.begin_transfer(plan_for(&old_device(), 0)).unwrap();
        assert_eq!(
            updater.begin_transfer(plan_for(&old_device(), 0)),
            Err(UpdateError::TransferInProgress)
        );

        device.release_data_writes();
        assert_eq!(collect_until(&rx, is_final).last(), Some(&FotaEvent::Completed));
    }

    #[test]
    fn test_abort_mid_transfer() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        device.hold_data_writes();
        let (updater, rx) = start(&device);
        collect_until(&rx, is_ready);

        updater.begin_transfer(plan_for(&old_device(), 0)).unwrap();
        wait_until(|| device.held_writers() > 0);

        updater.abort();
        let before: Vec<FotaEvent> = rx.try_iter().collect();
        assert!(!before.iter().any(is_final));
        assert_eq!(updater.state(), SessionState::Disconnected);
        assert!(!device.is_connected());

        updater.abort();
        updater.wait();
        assert!(rx.try_recv().is_err());
        assert_eq!(
            updater.begin_transfer(plan_for(&old_device(), 0)),
            Err(UpdateError::Aborted)
        );
    }

    #[test]
    fn test_abort_discards_queued_callbacks() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        let dispatcher = Arc::new(QueueDispatcher::new());
        let (observer, rx) = ChannelObserver::channel();
        let updater = Updater::with_dispatcher(
            DeviceAddress::new("C0:FF:EE:00:00:02"),
            Arc::new(SimulatedConnector::new(Arc::clone(&device))),
            fast_config(),
            Arc::new(observer),
            dispatcher.clone(),
        );

        wait_until(|| updater.state() == SessionState::Ready);
        assert!(rx.try_recv().is_err());
        assert!(dispatcher.pending() > 0);

        updater.abort();
        dispatcher.pump();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_queue_dispatcher_delivers_on_pump() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        let dispatcher = Arc::new(QueueDispatcher::new());
        let (observer, rx) = ChannelObserver::channel();
        let updater = Updater::with_dispatcher(
            DeviceAddress::new("C0:FF:EE:00:00:03"),
            Arc::new(SimulatedConnector::new(Arc::clone(&device))),
            fast_config(),
            Arc::new(observer),
            dispatcher.clone(),
        );

        wait_until(|| updater.state() == SessionState::Ready);
        wait_until(|| dispatcher.pending() > 0 && {
            dispatcher.pump();
            rx.try_iter().any(|e| is_ready(&e))
        });
    }

    /// Aborts the session from inside the Ready callback.
    struct AbortOnReady {
        updater: Mutex<Weak<Updater<AbortOnReady>>>,
        tx: Mutex<mpsc::Sender<FotaEvent>>,
    }

    impl FotaObserver for AbortOnReady {
        fn on_event(&self, event: &FotaEvent) {
            let _ = self.tx.lock().send(event.clone());
            if is_ready(event) {
                if let Some(updater) = self.updater.lock().upgrade() {
                    updater.abort();
                }
            }
        }
    }

    #[test]
    fn test_abort_from_callback() {
        let device = Arc::new(SimulatedDevice::new(old_device()));
        let (tx, rx) = mpsc::channel();
        let observer = Arc::new(AbortOnReady {
            updater: Mutex::new(Weak::new()),
            tx: Mutex::new(tx),
        });
        let updater = Arc::new(Updater::with_observer(
            DeviceAddress::new("C0:FF:EE:00:00:04"),
            Arc::new(SimulatedConnector::new(Arc::clone(&device))),
            fast_config(),
            Arc::clone(&observer),
        ));
        *observer.updater.lock() = Arc::downgrade(&updater);
        // The worker may have passed Ready before the weak link was set.
        if updater.state() == SessionState::Ready {
            updater.abort();
        }

        wait_until(|| updater.state() == SessionState::Disconnected);
        updater.wait();
        let events: Vec<FotaEvent> = rx.try_iter().collect();
        assert!(!events.iter().any(is_final));
        assert!(!device.is_connected());
    }

    #[test]
    fn test_config_roundtrip() {
        let path = std::env::temp_dir().join(format!("fota-config-{}.toml", std::process::id()));
        let config = UpdaterConfig {
            chip_family: 1,
            flash_top: Some(0x0207_0000),
            server: Some("https://updates.example.com/fota".into()),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = UpdaterConfig::load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, config);

        let partial: UpdaterConfig = toml::from_str("max_page_retries = 5").unwrap();
        assert_eq!(partial.max_page_retries, 5);
        assert_eq!(partial.requested_mtu, 512);
        assert_eq!(partial.page_interval_ms, 80);
        assert_eq!(partial.flash_top, None);
    }
}
