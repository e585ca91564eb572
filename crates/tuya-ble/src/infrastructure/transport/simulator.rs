//! In-process simulated Tuya BLE peripheral.
//!
//! # Why a simulated peripheral?
//!
//! A real transport needs a Bluetooth adapter and a device in range.  The
//! `SimulatedPeripheral` implements [`BleTransport`] by playing the device's
//! side of the protocol in memory: it answers the device-info request with
//! fresh session material, checks the pairing request, answers status
//! requests, applies datapoint writes and pushes datapoints of its own.
//! Everything goes through the real codec, fragmenter and key schedule, so
//! the engine cannot tell it apart from hardware.
//!
//! Test controls let a caller inject failures (refused connects, failed
//! writes, silent device, non-zero result codes, link loss) and inspect
//! every frame the host sent.
//!
//! # Usage in tests
//!
//! ```ignore
//! let peripheral = Arc::new(SimulatedPeripheral::new(DeviceProfile::default()));
//! let device = Device::new(addr, peripheral.clone(), resolver, config);
//!
//! device.update().await?;
//! assert_eq!(peripheral.connect_count(), 1);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tuya_ble_core::crypto::SessionKeys;
use tuya_ble_core::protocol::codec::{open, seal, Frame};
use tuya_ble_core::protocol::dp_payload::{encode_datapoints, parse_datapoints};
use tuya_ble_core::protocol::fragment::{split_packets, Reassembler};
use tuya_ble_core::protocol::messages::{
    build_pairing_request, Code, DeviceInfo, SecurityFlag, GATT_MTU,
};
use tuya_ble_core::{Datapoint, DatapointValue};

use crate::application::credentials::DeviceCredentials;
use crate::application::transport::{BleTransport, TransportError, TransportEvent};

/// Pair result the simulated device sends for a request it does not accept.
const PAIR_REJECTED: u8 = 1;

/// Identity and firmware description of the simulated device.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub uuid: String,
    pub local_key: String,
    pub device_id: String,
    pub category: String,
    pub product_id: String,
    pub device_version: (u8, u8),
    pub protocol_version: (u8, u8),
    pub hardware_version: (u8, u8),
    pub flags: u8,
    pub is_bound: bool,
    /// Datapoints the device reports on a status request.
    pub datapoints: Vec<(u8, DatapointValue)>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            uuid: "tuya5a1b2c3d4e5f".into(),
            local_key: "Yk3b9Xq0pLm2Vw7R".into(),
            device_id: "bf5a1b2c3d4e5f6a7b".into(),
            category: "wk".into(),
            product_id: "ajrhf1aj".into(),
            device_version: (1, 2),
            protocol_version: (3, 0),
            hardware_version: (1, 0),
            flags: 0,
            is_bound: true,
            datapoints: vec![
                (1, DatapointValue::Bool(true)),
                (2, DatapointValue::Value(215)),
                (4, DatapointValue::Enum(1)),
            ],
        }
    }
}

impl DeviceProfile {
    /// Credentials a host needs to talk to this device.
    pub fn credentials(&self) -> DeviceCredentials {
        DeviceCredentials {
            uuid: self.uuid.clone(),
            local_key: self.local_key.clone(),
            device_id: self.device_id.clone(),
            category: self.category.clone(),
            product_id: self.product_id.clone(),
            device_name: Some("Simulated thermostat".into()),
            product_model: Some("SIM-TRV".into()),
            product_name: Some("Simulated radiator valve".into()),
        }
    }
}

/// Tracks how many simulated links are being opened at the same time.
///
/// Share one gauge between several peripherals to observe connect
/// admission across devices.
#[derive(Debug, Default)]
pub struct ConnectGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConnectGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of concurrent link establishments seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct PeripheralState {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    establishing: bool,
    keys: SessionKeys,
    reassembler: Reassembler,
    seq: u32,
    protocol_version: (u8, u8),
    datapoints: BTreeMap<u8, DatapointValue>,
    received: Vec<Frame>,
    connect_count: u32,
    failing_connects: u32,
    failing_writes: u32,
    mute: bool,
    pair_result: u8,
    status_result: u8,
    write_result: u8,
}

/// A [`BleTransport`] that is also the device at the other end of the link.
pub struct SimulatedPeripheral {
    profile: DeviceProfile,
    connect_delay: Duration,
    gauge: Option<Arc<ConnectGauge>>,
    state: Mutex<PeripheralState>,
}

impl SimulatedPeripheral {
    pub fn new(profile: DeviceProfile) -> Self {
        let state = PeripheralState {
            protocol_version: profile.protocol_version,
            datapoints: profile.datapoints.iter().cloned().collect(),
            ..PeripheralState::default()
        };
        Self {
            profile,
            connect_delay: Duration::ZERO,
            gauge: None,
            state: Mutex::new(state),
        }
    }

    /// Makes every connect take `delay` and report to `gauge`.
    pub fn with_connect_gauge(mut self, delay: Duration, gauge: Arc<ConnectGauge>) -> Self {
        self.connect_delay = delay;
        self.gauge = Some(gauge);
        self
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn state(&self) -> MutexGuard<'_, PeripheralState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Controls ─────────────────────────────────────────────────────────────

    /// The next `count` connects are refused.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().failing_connects = count;
    }

    /// The next `count` packet writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.state().failing_writes = count;
    }

    /// A muted device records frames but never answers.
    pub fn set_mute(&self, mute: bool) {
        self.state().mute = mute;
    }

    pub fn set_pair_result(&self, result: u8) {
        self.state().pair_result = result;
    }

    pub fn set_status_result(&self, result: u8) {
        self.state().status_result = result;
    }

    /// Result code for subsequent well-formed datapoint writes.  A non-zero
    /// code rejects the write and leaves the device-side values untouched.
    pub fn set_write_result(&self, result: u8) {
        self.state().write_result = result;
    }

    /// Protocol version announced in subsequent device-info responses.
    pub fn set_protocol_version(&self, version: (u8, u8)) {
        self.state().protocol_version = version;
    }

    /// Drops the link as if the device went out of range.
    pub fn drop_link(&self) {
        let mut state = self.state();
        if let Some(events) = state.events.take() {
            debug!("simulated peripheral: link lost");
            let _ = events.send(TransportEvent::Disconnected);
        }
        state.reset_link();
    }

    /// Pushes datapoints with a plain `ReceiveDp` frame.
    pub fn push_datapoints(&self, values: &[(u8, DatapointValue)]) {
        let mut state = self.state();
        state.store(values);
        let payload = dp_payload(values);
        state.send(Code::ReceiveDp, SecurityFlag::Auth, payload, 0);
    }

    /// Pushes datapoints with a signed frame the host must acknowledge.
    pub fn push_signed_datapoints(&self, dp_seq: u16, flags: u8, values: &[(u8, DatapointValue)]) {
        let mut state = self.state();
        state.store(values);
        let mut payload = dp_seq.to_be_bytes().to_vec();
        payload.push(flags);
        payload.extend(dp_payload(values));
        state.send(Code::ReceiveSignDp, SecurityFlag::Auth, payload, 0);
    }

    /// Pushes a datapoint frame with one tampered byte, so the host can
    /// reassemble the envelope but its CRC check fails.
    ///
    /// At the 20-byte MTU the first packet ends inside the IV; flipping that
    /// byte flips exactly one plaintext byte of the first block.
    pub fn push_corrupted_datapoints(&self, values: &[(u8, DatapointValue)]) {
        let payload = dp_payload(values);
        self.state()
            .send_altered(Code::ReceiveDp, SecurityFlag::Auth, payload, 0, |mut packets| {
                if let Some(byte) = packets.first_mut().and_then(|p| p.last_mut()) {
                    *byte ^= 0xFF;
                }
                packets
            });
    }

    /// Pushes a multi-packet datapoint frame with its second packet missing.
    pub fn push_datapoints_with_gap(&self, values: &[(u8, DatapointValue)]) {
        let payload = dp_payload(values);
        self.state()
            .send_altered(Code::ReceiveDp, SecurityFlag::Auth, payload, 0, |mut packets| {
                if packets.len() > 1 {
                    packets.remove(1);
                }
                packets
            });
    }

    /// Asks the host for the time with `code` (one of the time request codes).
    pub fn request_time(&self, code: Code) {
        self.state().send(code, SecurityFlag::Auth, Vec::new(), 0);
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    pub fn connect_count(&self) -> u32 {
        self.state().connect_count
    }

    /// Every frame the host sent, in order.
    pub fn received(&self) -> Vec<Frame> {
        self.state().received.clone()
    }

    /// Frames the host sent with `code`.
    pub fn received_with(&self, code: Code) -> Vec<Frame> {
        self.state()
            .received
            .iter()
            .filter(|f| f.code == code as u16)
            .cloned()
            .collect()
    }

    /// The device-side value of datapoint `id`.
    pub fn datapoint(&self, id: u8) -> Option<DatapointValue> {
        self.state().datapoints.get(&id).cloned()
    }

    // ── Device side of the protocol ─────────────────────────────────────────

    fn handle_frame(&self, state: &mut PeripheralState, frame: Frame) {
        state.received.push(frame.clone());
        if state.mute {
            return;
        }
        let Some(code) = frame.known_code() else {
            return;
        };
        match code {
            Code::DeviceInfo => {
                let info = DeviceInfo {
                    device_version: self.profile.device_version,
                    protocol_version: state.protocol_version,
                    hardware_version: self.profile.hardware_version,
                    flags: self.profile.flags,
                    is_bound: self.profile.is_bound,
                    salt: rand::random(),
                    auth_key: rand::random(),
                };
                state.keys.apply_device_info(&info);
                state.send(code, SecurityFlag::Login, info.to_bytes(), frame.seq);
            }
            Code::Pair => {
                let expected = build_pairing_request(
                    &self.profile.uuid,
                    state.keys.local_key(),
                    &self.profile.device_id,
                );
                let result = if frame.payload == expected {
                    state.pair_result
                } else {
                    warn!("simulated peripheral: pairing request does not match");
                    PAIR_REJECTED
                };
                state.send(code, SecurityFlag::Session, vec![result], frame.seq);
            }
            Code::DeviceStatus => {
                let result = state.status_result;
                if result == 0 {
                    let all: Vec<_> = state
                        .datapoints
                        .iter()
                        .map(|(id, v)| (*id, v.clone()))
                        .collect();
                    state.send(Code::ReceiveDp, SecurityFlag::Auth, dp_payload(&all), 0);
                }
                state.send(code, SecurityFlag::Session, vec![result], frame.seq);
            }
            Code::SendDps => match parse_datapoints(&frame.payload, 0) {
                Ok(_) if state.write_result != 0 => {
                    let result = state.write_result;
                    state.send(code, SecurityFlag::Session, vec![result], frame.seq);
                }
                Ok(updates) => {
                    state.store(&updates);
                    state.send(Code::ReceiveDp, SecurityFlag::Auth, dp_payload(&updates), 0);
                    state.send(code, SecurityFlag::Session, vec![0], frame.seq);
                }
                Err(e) => {
                    warn!("simulated peripheral: bad datapoint write: {e}");
                    state.send(code, SecurityFlag::Session, vec![1], frame.seq);
                }
            },
            Code::Unbind | Code::DeviceReset => {
                state.send(code, SecurityFlag::Session, vec![0], frame.seq);
            }
            // Acknowledgements and time replies from the host.
            Code::ReceiveDp
            | Code::ReceiveTimeDp
            | Code::ReceiveSignDp
            | Code::ReceiveSignTimeDp
            | Code::ReceiveTime1Request
            | Code::ReceiveTime2Request => {}
        }
    }
}

impl PeripheralState {
    fn reset_link(&mut self) {
        self.events = None;
        self.establishing = false;
        self.keys.reset_session();
        self.reassembler.reset();
        self.seq = 0;
    }

    fn store(&mut self, values: &[(u8, DatapointValue)]) {
        for (id, value) in values {
            self.datapoints.insert(*id, value.clone());
        }
    }

    /// Seals, fragments and notifies one device frame.
    fn send(&mut self, code: Code, flag: SecurityFlag, payload: Vec<u8>, response_to: u32) {
        self.send_altered(code, flag, payload, response_to, |packets| packets);
    }

    /// Like `send`, but `alter` may tamper with the packets before they go out.
    fn send_altered(
        &mut self,
        code: Code,
        flag: SecurityFlag,
        payload: Vec<u8>,
        response_to: u32,
        alter: impl FnOnce(Vec<Vec<u8>>) -> Vec<Vec<u8>>,
    ) {
        let Some(events) = self.events.clone() else {
            return;
        };
        self.seq += 1;
        let frame = Frame::new(self.seq, response_to, code, payload);
        let packets = seal(&frame, flag, &self.keys)
            .and_then(|envelope| split_packets(&envelope, self.protocol_version.0, GATT_MTU));
        match packets {
            Ok(packets) => {
                for packet in alter(packets) {
                    let _ = events.send(TransportEvent::Notification(packet));
                }
            }
            Err(e) => warn!("simulated peripheral: cannot send {code:?}: {e}"),
        }
    }
}

fn dp_payload(values: &[(u8, DatapointValue)]) -> Vec<u8> {
    let now = Utc::now();
    let datapoints: Vec<Datapoint> = values
        .iter()
        .map(|(id, value)| Datapoint::new(*id, now, 0, value.clone()))
        .collect();
    encode_datapoints(&datapoints).unwrap_or_default()
}

#[async_trait]
impl BleTransport for SimulatedPeripheral {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let mut state = self.state();
        state.connect_count += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            if let Some(gauge) = &self.gauge {
                gauge.leave();
            }
            return Err(TransportError::ConnectFailed("simulated connect failure".into()));
        }
        state.reset_link();
        state.keys = SessionKeys::from_pairing_secret(&self.profile.local_key);
        state.events = Some(events);
        state.establishing = true;
        debug!("simulated peripheral: connected (#{})", state.connect_count);
        Ok(())
    }

    async fn subscribe(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        if std::mem::take(&mut state.establishing) {
            if let Some(gauge) = &self.gauge {
                gauge.leave();
            }
        }
        Ok(())
    }

    async fn write(&self, packet: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(TransportError::WriteFailed("simulated write failure".into()));
        }

        let envelope = match state.reassembler.push(packet) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("simulated peripheral: bad packet: {e}");
                return Ok(());
            }
        };
        match open(&envelope, &state.keys) {
            Ok((_, frame)) => self.handle_frame(&mut state, frame),
            Err(e) => warn!("simulated peripheral: cannot open frame: {e}"),
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.establishing {
            if let Some(gauge) = &self.gauge {
                gauge.leave();
            }
        }
        if let Some(events) = state.events.take() {
            let _ = events.send(TransportEvent::Disconnected);
        }
        state.reset_link();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().events.is_some()
    }
}
