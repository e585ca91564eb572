//! Integration tests for the device engine against the simulated peripheral.
//!
//! # Purpose
//!
//! These tests drive `Device` through its public API while a
//! `SimulatedPeripheral` plays the device.  Every frame goes through the
//! real codec, fragmenter and key schedule in both directions.  They verify:
//!
//! - The happy path: handshake, status request, datapoint writes and pushes.
//! - Inbound traffic the host must answer: acknowledgements and time requests.
//! - Undecodable or incomplete inbound frames are dropped, the link stays up.
//! - Link management: retries, "not reachable", automatic reconnect after an
//!   unexpected drop, no reconnect after `stop`, resend after a write failure.
//! - Error reporting: device result codes, response timeouts, protocol
//!   version gating.
//! - Concurrency: parallel requests on one link and connect admission shared
//!   by several devices.
//!
//! # Timing
//!
//! Inbound frames are processed on the engine's event task, so effects of
//! unsolicited device pushes are observed with `wait_until`, which polls a
//! condition for up to two seconds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_test::{assert_err, assert_ok};

use tuya_ble::infrastructure::storage::credentials::StaticCredentialStore;
use tuya_ble::infrastructure::transport::{ConnectGauge, DeviceProfile, SimulatedPeripheral};
use tuya_ble::{ConnectionState, Device, DeviceError, EngineConfig};
use tuya_ble_core::protocol::advertisement::AdvertisementData;
use tuya_ble_core::protocol::dp_payload::parse_datapoints;
use tuya_ble_core::protocol::messages::{Code, MANUFACTURER_DATA_ID};
use tuya_ble_core::{Datapoint, DatapointValue};

const ADDRESS: &str = "DC:23:4D:12:34:56";

// ── Helpers ───────────────────────────────────────────────────────────────────

fn test_config() -> EngineConfig {
    EngineConfig {
        response_timeout_ms: 500,
        connect_attempts: 3,
        session_settle_ms: 0,
        reconnect_backoff_initial_ms: 20,
        reconnect_backoff_max_ms: 100,
        ..EngineConfig::default()
    }
}

fn setup() -> (Device, Arc<SimulatedPeripheral>) {
    setup_with(SimulatedPeripheral::new(DeviceProfile::default()))
}

fn setup_with(peripheral: SimulatedPeripheral) -> (Device, Arc<SimulatedPeripheral>) {
    let peripheral = Arc::new(peripheral);
    let store = StaticCredentialStore::new();
    store
        .insert(ADDRESS, peripheral.profile().credentials())
        .expect("complete credentials");
    let device = Device::with_admission(
        ADDRESS,
        peripheral.clone(),
        Arc::new(store),
        test_config(),
        Arc::new(Semaphore::new(1)),
    );
    (device, peripheral)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    (count, move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

// ── Handshake and status ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_initialize_pairs_and_reads_status() {
    // Arrange
    let (device, peripheral) = setup();

    // Act
    assert_ok!(device.initialize().await);

    // Assert – link and handshake
    assert!(device.is_connected());
    assert!(device.is_paired());
    assert_eq!(device.connection_state(), ConnectionState::Paired);
    assert_eq!(peripheral.connect_count(), 1);
    let codes: Vec<u16> = peripheral.received().iter().map(|f| f.code).collect();
    assert_eq!(
        &codes[..3],
        &[Code::DeviceInfo as u16, Code::Pair as u16, Code::DeviceStatus as u16]
    );

    // Assert – metadata from the device-info response and the credentials
    assert_eq!(device.device_version(), "1.2");
    assert_eq!(device.protocol_version(), "3.0");
    assert_eq!(device.hardware_version(), "1.0");
    assert!(device.is_bound());
    assert_eq!(device.name(), "Simulated thermostat");
    assert_eq!(device.product_id(), "ajrhf1aj");

    // Assert – the status push arrives before the status response
    assert_eq!(device.datapoint_count(), 3);
    assert_eq!(device.datapoint(2).unwrap().value, DatapointValue::Value(215));
    assert!(!device.datapoint(1).unwrap().changed_by_device);
}

#[tokio::test]
async fn test_already_paired_device_is_accepted() {
    let (device, peripheral) = setup();
    peripheral.set_pair_result(2);

    assert_ok!(device.initialize().await);

    assert!(device.is_paired());
}

#[tokio::test]
async fn test_pair_rejection_fails_without_retry() {
    // Arrange
    let (device, peripheral) = setup();
    peripheral.set_pair_result(1);

    // Act
    let result = device.initialize().await;

    // Assert
    assert!(matches!(result, Err(DeviceError::Device { code: 1 })));
    assert_eq!(peripheral.connect_count(), 1);
    assert!(!device.is_connected());
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_status_error_code_is_reported() {
    let (device, peripheral) = setup();
    peripheral.set_status_result(5);

    let result = device.initialize().await;

    assert!(matches!(result, Err(DeviceError::Device { code: 5 })));
    assert!(device.is_paired());
}

#[tokio::test]
async fn test_advertisement_supplies_rssi_and_bound_flag() {
    // Arrange
    let (device, _peripheral) = setup();
    let advertisement = AdvertisementData {
        service_data: HashMap::new(),
        manufacturer_data: HashMap::from([(MANUFACTURER_DATA_ID, vec![0x00, 3, 0, 0, 0, 0, 0])]),
        rssi: Some(-67),
    };

    // Act
    device.update_advertisement(advertisement);

    // Assert
    assert_eq!(device.rssi(), Some(-67));
    assert!(!device.is_bound());
}

// ── Datapoint writes ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_write_reaches_device() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);

    // Act
    assert_ok!(device.set_datapoint(1, DatapointValue::Bool(false)).await);

    // Assert
    assert_eq!(peripheral.datapoint(1), Some(DatapointValue::Bool(false)));
    let writes = peripheral.received_with(Code::SendDps);
    assert_eq!(writes.len(), 1);
    let decoded = parse_datapoints(&writes[0].payload, 0).unwrap();
    assert_eq!(decoded, vec![(1, DatapointValue::Bool(false))]);
    assert_eq!(device.datapoint(1).unwrap().value, DatapointValue::Bool(false));
}

#[tokio::test]
async fn test_nested_batch_sends_single_frame() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);

    // Act – inner batch end sends nothing
    device.begin_batch();
    device.begin_batch();
    assert_ok!(device.set_datapoint(2, DatapointValue::Value(190)).await);
    assert_ok!(device.set_datapoint(4, DatapointValue::Enum(2)).await);
    assert_ok!(device.set_datapoint(2, DatapointValue::Value(200)).await);
    assert_ok!(device.end_batch().await);
    assert!(peripheral.received_with(Code::SendDps).is_empty());

    // Act – outer batch end flushes
    assert_ok!(device.end_batch().await);

    // Assert
    let writes = peripheral.received_with(Code::SendDps);
    assert_eq!(writes.len(), 1);
    let decoded = parse_datapoints(&writes[0].payload, 0).unwrap();
    assert_eq!(
        decoded,
        vec![(2, DatapointValue::Value(200)), (4, DatapointValue::Enum(2))]
    );
    assert_eq!(peripheral.datapoint(2), Some(DatapointValue::Value(200)));
}

#[tokio::test]
async fn test_type_change_is_rejected_locally() {
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);

    let result = device.set_datapoint(2, DatapointValue::Bool(true)).await;

    assert!(matches!(result, Err(DeviceError::Datapoint(_))));
    assert!(peripheral.received_with(Code::SendDps).is_empty());
    assert_eq!(device.datapoint(2).unwrap().value, DatapointValue::Value(215));
}

#[tokio::test]
async fn test_protocol_v2_device_rejects_writes() {
    // Arrange
    let (device, peripheral) = setup();
    peripheral.set_protocol_version((2, 0));
    assert_ok!(device.initialize().await);

    // Act
    let result = device.set_datapoint(1, DatapointValue::Bool(false)).await;

    // Assert
    assert!(matches!(result, Err(DeviceError::UnsupportedProtocolVersion(2))));
    assert_eq!(device.protocol_version(), "2.0");
    assert!(peripheral.received_with(Code::SendDps).is_empty());
}

#[tokio::test]
async fn test_rejected_write_reports_device_code() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);
    peripheral.set_write_result(3);

    // Act
    let result = device.set_datapoint(1, DatapointValue::Bool(false)).await;

    // Assert
    assert!(matches!(result, Err(DeviceError::Device { code: 3 })));
    assert_eq!(peripheral.received_with(Code::SendDps).len(), 1);
    assert_eq!(peripheral.datapoint(1), Some(DatapointValue::Bool(true)));
    assert!(device.is_paired());
}

// ── Device pushes ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_push_updates_store_and_notifies() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);
    let seen: Arc<Mutex<Vec<Datapoint>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = device.on_datapoints_changed(move |dps: &[Datapoint]| {
        sink.lock().unwrap().extend_from_slice(dps);
    });

    // Act
    peripheral.push_datapoints(&[(1, DatapointValue::Bool(false)), (9, DatapointValue::Value(-5))]);

    // Assert
    assert!(wait_until(|| seen.lock().unwrap().len() == 2).await);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen[0].id, 1);
    assert!(seen[0].changed_by_device);
    assert_eq!(seen[1].id, 9);
    assert!(!seen[1].changed_by_device);
    assert_eq!(device.datapoint(9).unwrap().value, DatapointValue::Value(-5));

    // Plain datapoint frames are acknowledged with an empty payload.
    assert!(wait_until(|| peripheral.received_with(Code::ReceiveDp).len() >= 2).await);
    assert!(peripheral
        .received_with(Code::ReceiveDp)
        .iter()
        .all(|ack| ack.payload.is_empty() && ack.response_to > 0));
}

#[tokio::test]
async fn test_signed_push_is_acknowledged_with_its_sequence() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);

    // Act
    peripheral.push_signed_datapoints(0x0102, 0x01, &[(4, DatapointValue::Enum(2))]);

    // Assert
    assert!(wait_until(|| !peripheral.received_with(Code::ReceiveSignDp).is_empty()).await);
    let ack = &peripheral.received_with(Code::ReceiveSignDp)[0];
    assert_eq!(ack.payload, vec![0x01, 0x02, 0x01, 0x00]);
    assert!(ack.response_to > 0);
    let dp = device.datapoint(4).unwrap();
    assert_eq!(dp.value, DatapointValue::Enum(2));
    assert_eq!(dp.flags, 0x01);
}

#[tokio::test]
async fn test_unsubscribed_callback_is_not_called() {
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let sub = device.on_datapoints_changed(move |_: &[Datapoint]| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    sub.unsubscribe();
    peripheral.push_datapoints(&[(1, DatapointValue::Bool(false))]);

    assert!(wait_until(|| device.datapoint(1).unwrap().value == DatapointValue::Bool(false)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_time_requests_are_answered() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);

    // Act
    peripheral.request_time(Code::ReceiveTime1Request);
    peripheral.request_time(Code::ReceiveTime2Request);

    // Assert – type 1: 13 ASCII digits of milliseconds + i16 timezone
    assert!(wait_until(|| !peripheral.received_with(Code::ReceiveTime1Request).is_empty()).await);
    let time1 = &peripheral.received_with(Code::ReceiveTime1Request)[0];
    assert_eq!(time1.payload.len(), 15);
    assert!(time1.payload[..13].iter().all(u8::is_ascii_digit));
    assert!(time1.response_to > 0);

    // Assert – type 2: seven calendar bytes + i16 timezone
    assert!(wait_until(|| !peripheral.received_with(Code::ReceiveTime2Request).is_empty()).await);
    let time2 = &peripheral.received_with(Code::ReceiveTime2Request)[0];
    assert_eq!(time2.payload.len(), 9);
    assert!((1..=12).contains(&time2.payload[1]));
    assert!(time2.payload[6] <= 6);
}

#[tokio::test]
async fn test_bad_inbound_frames_are_dropped_without_losing_link() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);

    // Act – a frame that fails verification, then one with a missing packet
    peripheral.push_corrupted_datapoints(&[(2, DatapointValue::Value(100))]);
    peripheral.push_datapoints_with_gap(&[
        (2, DatapointValue::Value(101)),
        (9, DatapointValue::Value(7)),
        (10, DatapointValue::Value(8)),
    ]);
    peripheral.push_datapoints(&[(11, DatapointValue::Value(12))]);

    // Assert – the frame after the bad ones is still processed
    assert!(wait_until(|| device.datapoint(11).is_some()).await);
    assert_eq!(device.datapoint(2).unwrap().value, DatapointValue::Value(215));
    assert!(device.datapoint(9).is_none());
    assert!(device.is_paired());
    assert_eq!(peripheral.connect_count(), 1);

    // Assert – requests keep working on the same link
    assert_ok!(device.update().await);
    assert_eq!(peripheral.connect_count(), 1);
}

// ── Link management ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_retries_until_success() {
    let (device, peripheral) = setup();
    peripheral.fail_next_connects(2);

    assert_ok!(device.initialize().await);

    assert_eq!(peripheral.connect_count(), 3);
    assert!(device.is_paired());
}

#[tokio::test]
async fn test_unreachable_device_reports_attempts() {
    // Arrange
    let (device, peripheral) = setup();
    peripheral.fail_next_connects(10);

    // Act
    let err = assert_err!(device.initialize().await);

    // Assert
    assert!(matches!(err, DeviceError::NotReachable { attempts: 3 }));
    assert_eq!(peripheral.connect_count(), 3);
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unexpected_drop_reconnects_once() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);
    let (connected, on_connected) = counter();
    let (disconnected, on_disconnected) = counter();
    let _c = device.on_connected(on_connected);
    let _d = device.on_disconnected(on_disconnected);

    // Act
    peripheral.drop_link();

    // Assert
    assert!(wait_until(|| peripheral.connect_count() == 2 && device.is_paired()).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(peripheral.connect_count(), 2);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(connected.load(Ordering::SeqCst), 1);

    // The new session works.
    assert_ok!(device.set_datapoint(1, DatapointValue::Bool(false)).await);
}

#[tokio::test]
async fn test_stop_prevents_reconnect() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);
    let (disconnected, on_disconnected) = counter();
    let _d = device.on_disconnected(on_disconnected);

    // Act
    device.stop().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Assert
    assert!(!device.is_connected());
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert_eq!(peripheral.connect_count(), 1);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);

    // A later request connects again.
    assert_ok!(device.update().await);
    assert_eq!(peripheral.connect_count(), 2);
}

#[tokio::test]
async fn test_write_failure_resends_on_new_link() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);
    peripheral.fail_next_writes(1);

    // Act
    assert_ok!(device.set_datapoint(1, DatapointValue::Bool(false)).await);

    // Assert
    assert_eq!(peripheral.connect_count(), 2);
    assert_eq!(peripheral.received_with(Code::SendDps).len(), 1);
    assert_eq!(peripheral.datapoint(1), Some(DatapointValue::Bool(false)));
}

#[tokio::test]
async fn test_silent_device_times_out() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);
    peripheral.set_mute(true);

    // Act
    let err = assert_err!(device.update().await);

    // Assert
    assert!(matches!(err, DeviceError::ResponseTimeout { .. }));
    assert!(device.is_paired());

    // The device answers again once it wakes up.
    peripheral.set_mute(false);
    assert_ok!(device.update().await);
}

// ── Concurrency ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_requests_all_complete() {
    // Arrange
    let (device, peripheral) = setup();
    assert_ok!(device.initialize().await);

    // Act
    let (a, b, c, d) = tokio::join!(
        device.update(),
        device.update(),
        device.set_datapoint(2, DatapointValue::Value(180)),
        device.update(),
    );

    // Assert
    assert_ok!(a);
    assert_ok!(b);
    assert_ok!(c);
    assert_ok!(d);
    assert_eq!(peripheral.received_with(Code::DeviceStatus).len(), 4);
    assert_eq!(peripheral.connect_count(), 1);
}

#[tokio::test]
async fn test_concurrent_first_requests_share_one_connect() {
    let (device, peripheral) = setup();

    let (a, b) = tokio::join!(device.update(), device.update());

    assert_ok!(a);
    assert_ok!(b);
    assert_eq!(peripheral.connect_count(), 1);
}

#[tokio::test]
async fn test_shared_admission_serialises_link_setup() {
    // Arrange – two devices, one admission permit
    let gauge = ConnectGauge::new();
    let admission = Arc::new(Semaphore::new(1));
    let store = Arc::new(StaticCredentialStore::new());
    let mut devices = Vec::new();
    for (i, address) in ["DC:23:4D:00:00:0A", "DC:23:4D:00:00:0B"].into_iter().enumerate() {
        let profile = DeviceProfile {
            device_id: format!("bf00000000000000{i}"),
            ..DeviceProfile::default()
        };
        store.insert(address, profile.credentials()).unwrap();
        let peripheral = Arc::new(
            SimulatedPeripheral::new(profile)
                .with_connect_gauge(Duration::from_millis(50), gauge.clone()),
        );
        devices.push(Device::with_admission(
            address,
            peripheral,
            store.clone(),
            test_config(),
            admission.clone(),
        ));
    }

    // Act
    let (a, b) = tokio::join!(devices[0].initialize(), devices[1].initialize());

    // Assert
    assert_ok!(a);
    assert_ok!(b);
    assert_eq!(gauge.peak(), 1);
}
