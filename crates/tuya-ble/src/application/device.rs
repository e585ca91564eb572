//! The protocol engine: one [`Device`] per BLE peripheral.
//!
//! # How a request travels (for beginners)
//!
//! ```text
//!  set_datapoint / update
//!        │
//!        ▼
//!  ensure_connected ──► connect ─► subscribe ─► DeviceInfo ─► Pair   (once per link)
//!        │
//!        ▼
//!  transmit: seq = next() ─► register pending[seq] ─► seal ─► split ─► write
//!        │
//!        ▼
//!  wait for pending[seq] (resolved by the inbound dispatcher) or time out
//! ```
//!
//! Inbound notifications run on a per-link event task: packets are
//! reassembled, decrypted and dispatched by message code (see the
//! `inbound` module).  Replies resolve the pending entry whose sequence
//! number matches their `response_to` field.
//!
//! # Locks
//!
//! - `connect_lock` (async) serialises link establishment and teardown for
//!   this device.
//! - `admission` (a semaphore shared by all devices by default) bounds how
//!   many links are being opened at once across the process.  It is held
//!   only while the transport connects and subscribes.
//! - `operation_lock` (async) serialises packet writes so fragments of two
//!   frames never interleave.
//! - The sequence counter is atomic.
//! - Plain state (`session`, `store`, `pending`, `reassembler`) sits behind
//!   `std::sync::Mutex`es that are never held across an `.await`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tuya_ble_core::crypto::SessionKeys;
use tuya_ble_core::protocol::advertisement::AdvertisementData;
use tuya_ble_core::protocol::codec::{seal, Frame};
use tuya_ble_core::protocol::dp_payload::encode_datapoints;
use tuya_ble_core::protocol::fragment::{split_packets, Reassembler};
use tuya_ble_core::protocol::messages::{build_pairing_request, Code};
use tuya_ble_core::protocol::SequenceCounter;
use tuya_ble_core::{
    Datapoint, DatapointError, DatapointStore, DatapointType, DatapointValue, ProtocolError,
};

use crate::application::config::EngineConfig;
use crate::application::connection::{ConnectionState, LinkEvent};
use crate::application::credentials::{CredentialResolver, DeviceCredentials};
use crate::application::listeners::{Listeners, Subscription};
use crate::application::pending::PendingRequests;
use crate::application::transport::{BleTransport, TransportError, TransportEvent};

/// Protocol version whose multi-datapoint write format this engine speaks.
const DATAPOINT_WRITE_PROTOCOL: u8 = 3;

/// Version assumed until the advertisement or device-info response says otherwise.
const DEFAULT_PROTOCOL_VERSION: u8 = 2;

/// Errors surfaced by [`Device`] operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no credentials known for device {0}")]
    CredentialsNotFound(String),

    #[error("credential lookup failed: {0}")]
    Credentials(String),

    #[error("device not reachable after {attempts} connection attempts")]
    NotReachable { attempts: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("timed out waiting for the response to #{seq}")]
    ResponseTimeout { seq: u32 },

    /// The device answered with a non-zero result code.
    #[error("device reported error code {code}")]
    Device { code: u8 },

    /// The link dropped while a request was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    #[error("device did not complete the pairing handshake")]
    HandshakeRejected,

    #[error("protocol version {0} does not support datapoint writes")]
    UnsupportedProtocolVersion(u8),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("datapoint error: {0}")]
    Datapoint(#[from] DatapointError),

    /// The device was stopped while the operation was in progress.
    #[error("device stopped")]
    Stopped,
}

impl DeviceError {
    /// Failures worth another connection attempt.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::Transport(_)
                | DeviceError::ResponseTimeout { .. }
                | DeviceError::ConnectionLost
        )
    }
}

pub(super) type Outcome = Result<(), DeviceError>;

/// Everything learned about the device and the current link.
#[derive(Debug)]
pub(super) struct Session {
    pub(super) state: ConnectionState,
    pub(super) keys: SessionKeys,
    pub(super) credentials: Option<DeviceCredentials>,
    pub(super) advertisement: Option<AdvertisementData>,
    pub(super) advertised_uuid: Option<String>,
    pub(super) device_version: String,
    pub(super) protocol_version_str: String,
    pub(super) hardware_version: String,
    pub(super) protocol_version: u8,
    pub(super) flags: u8,
    pub(super) is_bound: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            keys: SessionKeys::new(),
            credentials: None,
            advertisement: None,
            advertised_uuid: None,
            device_version: String::new(),
            protocol_version_str: String::new(),
            hardware_version: String::new(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            flags: 0,
            is_bound: false,
        }
    }
}

pub(super) struct DeviceInner {
    pub(super) address: String,
    transport: Arc<dyn BleTransport>,
    resolver: Arc<dyn CredentialResolver>,
    pub(super) config: EngineConfig,
    admission: Arc<Semaphore>,
    connect_lock: AsyncMutex<()>,
    operation_lock: AsyncMutex<()>,
    sequence: SequenceCounter,
    pub(super) session: Mutex<Session>,
    pub(super) store: Mutex<DatapointStore>,
    pub(super) pending: Mutex<PendingRequests<Outcome>>,
    pub(super) reassembler: Mutex<Reassembler>,
    pub(super) listeners: Arc<Listeners>,
    stopped: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    /// Identifies the current link; events from older links are ignored.
    generation: AtomicU64,
}

/// Locks a std mutex, recovering the data if a callback panicked while
/// holding it.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static ADMISSION: OnceLock<Arc<Semaphore>> = OnceLock::new();

/// The process-wide admission semaphore, sized by the first caller.
fn shared_admission(permits: usize) -> Arc<Semaphore> {
    Arc::clone(ADMISSION.get_or_init(|| Arc::new(Semaphore::new(permits.max(1)))))
}

/// Handle to one Tuya BLE device.  Cheap to clone; clones share the link.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.inner.address)
            .field("state", &self.connection_state())
            .finish()
    }
}

impl Device {
    /// Creates a device that shares the process-wide connect admission.
    pub fn new(
        address: impl Into<String>,
        transport: Arc<dyn BleTransport>,
        resolver: Arc<dyn CredentialResolver>,
        config: EngineConfig,
    ) -> Self {
        let admission = shared_admission(config.max_concurrent_connects);
        Self::with_admission(address, transport, resolver, config, admission)
    }

    /// Creates a device bounded by a caller-supplied admission semaphore.
    pub fn with_admission(
        address: impl Into<String>,
        transport: Arc<dyn BleTransport>,
        resolver: Arc<dyn CredentialResolver>,
        config: EngineConfig,
        admission: Arc<Semaphore>,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                address: address.into(),
                transport,
                resolver,
                config,
                admission,
                connect_lock: AsyncMutex::new(()),
                operation_lock: AsyncMutex::new(()),
                sequence: SequenceCounter::new(),
                session: Mutex::new(Session::default()),
                store: Mutex::new(DatapointStore::new()),
                pending: Mutex::new(PendingRequests::new()),
                reassembler: Mutex::new(Reassembler::new()),
                listeners: Listeners::new(),
                stopped: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Resolves credentials, applies any advertisement data, then connects
    /// and requests the current status.
    pub async fn initialize(&self) -> Result<(), DeviceError> {
        debug!("{}: initializing", self.inner.address);
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.inner.load_credentials(false).await?;
        self.inner.apply_advertisement();
        self.update().await
    }

    /// Asks the device for its status.  Datapoints arrive asynchronously
    /// and are reported through the datapoint callbacks.
    pub async fn update(&self) -> Result<(), DeviceError> {
        debug!("{}: updating", self.inner.address);
        self.inner.stopped.store(false, Ordering::SeqCst);
        let fresh = self.inner.ensure_connected().await?;
        if fresh {
            // Lets the device push its time request and first datapoints.
            let settle = self.inner.config.session_settle();
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
        }
        self.inner.request(Code::DeviceStatus, Vec::new()).await
    }

    /// Closes the link and cancels any scheduled reconnect.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Replaces the advertisement data and decodes it.
    pub fn update_advertisement(&self, advertisement: AdvertisementData) {
        lock(&self.inner.session).advertisement = Some(advertisement);
        self.inner.apply_advertisement();
    }

    // ── Datapoints ───────────────────────────────────────────────────────────

    pub fn datapoint(&self, id: u8) -> Option<Datapoint> {
        lock(&self.inner.store).get(id).cloned()
    }

    /// All known datapoints ordered by id.
    pub fn datapoints(&self) -> Vec<Datapoint> {
        lock(&self.inner.store).snapshot()
    }

    pub fn datapoint_count(&self) -> usize {
        lock(&self.inner.store).len()
    }

    pub fn has_datapoint(&self, id: u8, kind: Option<DatapointType>) -> bool {
        lock(&self.inner.store).has_id(id, kind)
    }

    /// Returns datapoint `id`, creating it locally with `initial` if unknown.
    /// Nothing is sent to the device.
    pub fn get_or_create_datapoint(&self, id: u8, initial: DatapointValue) -> Datapoint {
        lock(&self.inner.store).get_or_create(id, initial).clone()
    }

    /// Writes a datapoint.  Outside a batch the value is sent immediately;
    /// inside one it is sent when the outermost batch ends.
    ///
    /// # Errors
    ///
    /// Fails with [`DeviceError::Datapoint`] on a type change, and with any
    /// connection or device error raised while sending.
    pub async fn set_datapoint(&self, id: u8, value: DatapointValue) -> Result<(), DeviceError> {
        let to_send = lock(&self.inner.store).set_value(id, value)?;
        match to_send {
            Some(ids) => self.inner.send_datapoints(&ids).await,
            None => Ok(()),
        }
    }

    /// Opens a (possibly nested) write batch.
    pub fn begin_batch(&self) {
        lock(&self.inner.store).begin_batch();
    }

    /// Closes one batch level; the outermost close sends every collected
    /// datapoint in one frame.
    pub async fn end_batch(&self) -> Result<(), DeviceError> {
        let to_send = lock(&self.inner.store).end_batch();
        match to_send {
            Some(ids) => self.inner.send_datapoints(&ids).await,
            None => Ok(()),
        }
    }

    // ── Callbacks ────────────────────────────────────────────────────────────

    pub fn on_connected(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_connected(Arc::new(callback))
    }

    /// Called with the datapoints touched by each inbound datapoint frame.
    pub fn on_datapoints_changed(
        &self,
        callback: impl Fn(&[Datapoint]) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.on_datapoints(Arc::new(callback))
    }

    pub fn on_disconnected(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_disconnected(Arc::new(callback))
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// The configured device name, falling back to the address.
    pub fn name(&self) -> String {
        lock(&self.inner.session)
            .credentials
            .as_ref()
            .and_then(|c| c.device_name.clone())
            .unwrap_or_else(|| self.inner.address.clone())
    }

    /// The uuid from the credentials, or from the advertisement if no
    /// credentials are loaded yet.
    pub fn uuid(&self) -> String {
        let session = lock(&self.inner.session);
        session
            .credentials
            .as_ref()
            .map(|c| c.uuid.clone())
            .or_else(|| session.advertised_uuid.clone())
            .unwrap_or_default()
    }

    pub fn device_id(&self) -> String {
        self.credential_field(|c| c.device_id.clone())
    }

    pub fn category(&self) -> String {
        self.credential_field(|c| c.category.clone())
    }

    pub fn product_id(&self) -> String {
        self.credential_field(|c| c.product_id.clone())
    }

    pub fn product_model(&self) -> String {
        self.credential_field(|c| c.product_model.clone().unwrap_or_default())
    }

    pub fn product_name(&self) -> String {
        self.credential_field(|c| c.product_name.clone().unwrap_or_default())
    }

    fn credential_field(&self, field: impl Fn(&DeviceCredentials) -> String) -> String {
        lock(&self.inner.session)
            .credentials
            .as_ref()
            .map(field)
            .unwrap_or_default()
    }

    /// `"major.minor"` from the device-info response, empty before it.
    pub fn device_version(&self) -> String {
        lock(&self.inner.session).device_version.clone()
    }

    pub fn protocol_version(&self) -> String {
        lock(&self.inner.session).protocol_version_str.clone()
    }

    pub fn hardware_version(&self) -> String {
        lock(&self.inner.session).hardware_version.clone()
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.inner.session).is_bound
    }

    pub fn flags(&self) -> u8 {
        lock(&self.inner.session).flags
    }

    /// Signal strength from the last advertisement.
    pub fn rssi(&self) -> Option<i16> {
        self.inner.rssi()
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.session).state
    }

    /// Whether the transport link is open (paired or not).
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Whether the handshake has completed on the current link.
    pub fn is_paired(&self) -> bool {
        lock(&self.inner.session).state.is_paired()
    }
}

// ── Engine internals ──────────────────────────────────────────────────────────

impl DeviceInner {
    fn rssi(&self) -> Option<i16> {
        lock(&self.session).advertisement.as_ref().and_then(|a| a.rssi)
    }

    /// Applies `event` to the connection state machine.
    pub(super) fn transition(&self, event: LinkEvent) -> bool {
        let mut session = lock(&self.session);
        match session.state.on(event) {
            Some(next) => {
                debug!("{}: {} -> {}", self.address, session.state, next);
                session.state = next;
                true
            }
            None => {
                debug!("{}: ignoring {event:?} in state {}", self.address, session.state);
                false
            }
        }
    }

    fn link_ready(&self) -> bool {
        self.transport.is_connected() && lock(&self.session).state.is_paired()
    }

    async fn load_credentials(&self, force_update: bool) -> Result<(), DeviceError> {
        if !force_update && lock(&self.session).credentials.is_some() {
            return Ok(());
        }
        let credentials = self
            .resolver
            .credentials(&self.address, force_update)
            .await
            .map_err(DeviceError::Credentials)?
            .ok_or_else(|| DeviceError::CredentialsNotFound(self.address.clone()))?;

        let missing = credentials.missing_fields();
        if !missing.is_empty() {
            return Err(DeviceError::Credentials(format!(
                "missing fields: {}",
                missing.join(", ")
            )));
        }

        debug!("{}: loaded credentials {:?}", self.address, credentials);
        let mut session = lock(&self.session);
        session.keys = SessionKeys::from_pairing_secret(&credentials.local_key);
        session.credentials = Some(credentials);
        Ok(())
    }

    fn apply_advertisement(&self) {
        let mut session = lock(&self.session);
        let Some(info) = session.advertisement.as_ref().map(|a| a.decode()) else {
            return;
        };
        if let Some(bound) = info.is_bound {
            session.is_bound = bound;
        }
        if let Some(version) = info.protocol_version {
            session.protocol_version = version;
        }
        if info.uuid.is_some() {
            session.advertised_uuid = info.uuid;
        }
    }

    // ── Connecting ───────────────────────────────────────────────────────────

    /// Makes sure a paired link exists.  Returns `true` if a new link had
    /// to be established.
    pub(super) async fn ensure_connected(self: &Arc<Self>) -> Result<bool, DeviceError> {
        if self.link_ready() {
            return Ok(false);
        }
        let _guard = match self.connect_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(
                    "{}: connection already in progress, waiting for it to complete",
                    self.address
                );
                self.connect_lock.lock().await
            }
        };
        if self.link_ready() {
            return Ok(false);
        }
        self.load_credentials(false).await?;

        if lock(&self.session).state != ConnectionState::Disconnected {
            // The transport dropped but its event has not been processed yet.
            self.teardown_link().await;
        }

        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(DeviceError::Stopped);
            }
            debug!(
                "{}: connecting, attempt {attempt}/{attempts}; RSSI: {:?}",
                self.address,
                self.rssi()
            );
            match self.establish_link().await {
                Ok(()) => {
                    info!("{}: successfully connected", self.address);
                    self.listeners.fire_connected();
                    return Ok(true);
                }
                Err(e) if e.is_retryable() => {
                    warn!("{}: connection attempt {attempt} failed: {e}", self.address);
                    self.teardown_link().await;
                    let delay = self.config.connect_retry_delay();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    error!("{}: handshake failed: {e}", self.address);
                    self.teardown_link().await;
                    return Err(e);
                }
            }
        }
        error!(
            "{}: connecting, all attempts failed; RSSI: {:?}",
            self.address,
            self.rssi()
        );
        Err(DeviceError::NotReachable { attempts })
    }

    /// One connect → subscribe → device info → pair sequence.
    async fn establish_link(self: &Arc<Self>) -> Outcome {
        self.transition(LinkEvent::ConnectRequested);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let _permit = self
                .admission
                .acquire()
                .await
                .map_err(|_| DeviceError::Stopped)?;
            self.transport.connect(events_tx).await?;
            self.spawn_event_loop(generation, events_rx);
            self.transport.subscribe().await?;
        }
        debug!("{}: connected; RSSI: {:?}", self.address, self.rssi());
        self.transition(LinkEvent::LinkUp);

        debug!("{}: sending device info request", self.address);
        self.transmit(Code::DeviceInfo, &[], 0, true).await?;
        if lock(&self.session).state != ConnectionState::AwaitingPairAck {
            return Err(DeviceError::HandshakeRejected);
        }

        let pairing_request = {
            let session = lock(&self.session);
            let credentials = session
                .credentials
                .as_ref()
                .ok_or_else(|| DeviceError::CredentialsNotFound(self.address.clone()))?;
            build_pairing_request(
                &credentials.uuid,
                session.keys.local_key(),
                &credentials.device_id,
            )
        };
        debug!("{}: sending pairing request", self.address);
        self.transmit(Code::Pair, &pairing_request, 0, true).await?;
        if !lock(&self.session).state.is_paired() {
            return Err(DeviceError::HandshakeRejected);
        }
        Ok(())
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.generation.load(Ordering::SeqCst) != generation {
                    debug!("{}: ignoring event from a closed link", inner.address);
                    break;
                }
                match event {
                    TransportEvent::Notification(data) => inner.handle_notification(&data),
                    TransportEvent::Disconnected => {
                        inner.link_down(false);
                        break;
                    }
                }
            }
        });
    }

    /// Closes the current link on purpose.  Caller holds `connect_lock` or
    /// is inside `ensure_connected`.
    async fn teardown_link(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.transition(LinkEvent::DisconnectRequested);
        if self.transport.is_connected() {
            if let Err(e) = self.transport.disconnect().await {
                debug!("{}: disconnect failed: {e}", self.address);
            }
        }
        self.link_down(true);
    }

    /// Resets all per-link state after the link went away.
    fn link_down(self: &Arc<Self>, expected: bool) {
        let was_paired = {
            let mut session = lock(&self.session);
            let was_paired = session.state.is_paired();
            session.state = session
                .state
                .on(LinkEvent::LinkLost)
                .unwrap_or(ConnectionState::Disconnected);
            session.keys.reset_session();
            was_paired
        };
        self.sequence.reset();
        lock(&self.reassembler).reset();
        let abandoned = lock(&self.pending).clear();
        if abandoned > 0 {
            debug!("{}: abandoned {abandoned} pending requests", self.address);
        }
        if was_paired {
            self.listeners.fire_disconnected();
        }

        if expected {
            debug!("{}: disconnected from device; RSSI: {:?}", self.address, self.rssi());
            return;
        }
        warn!(
            "{}: device unexpectedly disconnected; RSSI: {:?}",
            self.address,
            self.rssi()
        );
        if was_paired && !self.stopped.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("{}: reconnect already scheduled", self.address);
            return;
        }
        debug!("{}: scheduling reconnect; RSSI: {:?}", self.address, self.rssi());
        let weak = Arc::downgrade(self);
        let max = self.config.reconnect_backoff_max();
        let mut delay = self.config.reconnect_backoff_initial();
        let handle = tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.stopped.load(Ordering::SeqCst) {
                    inner.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                match inner.ensure_connected().await {
                    Ok(_) => {
                        debug!("{}: reconnect, connection ensured", inner.address);
                        inner.reconnecting.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        warn!(
                            "{}: reconnect failed: {e}; backing off {delay:?}",
                            inner.address
                        );
                    }
                }
                drop(inner);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max);
            }
        });
        *lock(&self.reconnect_task) = Some(handle);
    }

    async fn stop(self: &Arc<Self>) {
        debug!("{}: stop", self.address);
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;
        self.teardown_link().await;
    }

    /// Drops the link so the next request starts a fresh handshake.
    async fn reset_link(self: &Arc<Self>) {
        let _guard = self.connect_lock.lock().await;
        self.teardown_link().await;
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    async fn send_datapoints(self: &Arc<Self>, ids: &[u8]) -> Outcome {
        self.stopped.store(false, Ordering::SeqCst);
        self.ensure_connected().await?;
        let version = lock(&self.session).protocol_version;
        if version != DATAPOINT_WRITE_PROTOCOL {
            return Err(DeviceError::UnsupportedProtocolVersion(version));
        }
        let datapoints = lock(&self.store).collect(ids);
        let payload = encode_datapoints(&datapoints)?;
        self.request(Code::SendDps, payload).await
    }

    /// Sends a command on a paired link and waits for its response.
    ///
    /// A transport failure drops the link, reconnects and sends the command
    /// once more, re-encrypted under the new session.
    async fn request(self: &Arc<Self>, code: Code, payload: Vec<u8>) -> Outcome {
        self.ensure_connected().await?;
        match self.transmit(code, &payload, 0, true).await {
            Err(DeviceError::Transport(e)) => {
                warn!(
                    "{}: communication failed sending {code:?}: {e}; reconnecting to resend",
                    self.address
                );
                self.reset_link().await;
                self.ensure_connected().await?;
                self.transmit(code, &payload, 0, true).await
            }
            other => other,
        }
    }

    /// Sends an unsolicited reply without waiting for anything back.
    pub(super) fn spawn_response(self: &Arc<Self>, code: Code, payload: Vec<u8>, response_to: u32) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if !inner.transport.is_connected() {
                return;
            }
            if let Err(e) = inner.transmit(code, &payload, response_to, false).await {
                warn!(
                    "{}: failed to send {code:?} in response to #{response_to}: {e}",
                    inner.address
                );
            }
        });
    }

    /// Encrypts, fragments and writes one frame; optionally waits for the
    /// response correlated by sequence number.
    async fn transmit(
        &self,
        code: Code,
        payload: &[u8],
        response_to: u32,
        wait_for_response: bool,
    ) -> Outcome {
        let seq = self.sequence.next();
        let waiter = wait_for_response.then(|| lock(&self.pending).register(seq));

        let packets = match self.build_packets(seq, response_to, code, payload) {
            Ok(packets) => packets,
            Err(e) => {
                lock(&self.pending).remove(seq);
                return Err(e.into());
            }
        };
        if response_to > 0 {
            debug!(
                "{}: sending packet: #{seq} {code:?} in response to #{response_to}",
                self.address
            );
        } else {
            debug!("{}: sending packet: #{seq} {code:?}", self.address);
        }

        if let Err(e) = self.write_packets(&packets).await {
            lock(&self.pending).remove(seq);
            error!("{}: communication failed: {e}", self.address);
            return Err(e.into());
        }

        let Some(waiter) = waiter else {
            return Ok(());
        };
        match tokio::time::timeout(self.config.response_timeout(), waiter).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DeviceError::ConnectionLost),
            Err(_) => {
                lock(&self.pending).remove(seq);
                error!(
                    "{}: timeout receiving response to #{seq}; RSSI: {:?}",
                    self.address,
                    self.rssi()
                );
                Err(DeviceError::ResponseTimeout { seq })
            }
        }
    }

    fn build_packets(
        &self,
        seq: u32,
        response_to: u32,
        code: Code,
        payload: &[u8],
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let session = lock(&self.session);
        let frame = Frame::new(seq, response_to, code, payload.to_vec());
        let envelope = seal(&frame, code.outbound_security_flag(), &session.keys)?;
        split_packets(&envelope, session.protocol_version, self.config.mtu)
    }

    async fn write_packets(&self, packets: &[Vec<u8>]) -> Result<(), TransportError> {
        let _guard = match self.operation_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(
                    "{}: operation already in progress, waiting for it to complete",
                    self.address
                );
                self.operation_lock.lock().await
            }
        };
        for packet in packets {
            self.transport.write(packet).await?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
