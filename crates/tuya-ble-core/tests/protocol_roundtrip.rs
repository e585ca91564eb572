//! Integration tests for the tuya-ble-core pipeline.
//!
//! These tests push frames through the complete public path a real link
//! uses (encode, seal, split into packets, reassemble, open, decode) and
//! check the handshake key schedule end to end.

use tuya_ble_core::{
    crypto::SessionKeys,
    domain::store::DatapointStore,
    protocol::{
        codec::{open, seal},
        dp_payload::{encode_datapoints, parse_inbound},
        fragment::{split_packets, Reassembler},
        messages::{build_pairing_request, Code, DeviceInfo, SecurityFlag, GATT_MTU},
        sequence::SequenceCounter,
    },
    DatapointValue, Frame, ProtocolError,
};

fn device_info() -> DeviceInfo {
    DeviceInfo {
        device_version: (2, 0),
        protocol_version: (3, 0),
        hardware_version: (1, 0),
        flags: 0,
        is_bound: true,
        salt: *b"salt42",
        auth_key: [0x5A; 32],
    }
}

/// Seals, splits, reassembles and opens a frame, returning what the peer sees.
fn transfer(frame: &Frame, flag: SecurityFlag, keys: &SessionKeys) -> (SecurityFlag, Frame) {
    let envelope = seal(frame, flag, keys).expect("seal must succeed");
    let packets = split_packets(&envelope, 3, GATT_MTU).expect("split must succeed");
    let mut reassembler = Reassembler::new();
    let mut complete = None;
    for packet in &packets {
        assert!(packet.len() <= GATT_MTU);
        if let Some(env) = reassembler.push(packet).expect("push must succeed") {
            complete = Some(env);
        }
    }
    let envelope = complete.expect("last packet must complete the envelope");
    open(&envelope, keys).expect("open must succeed")
}

#[test]
fn test_device_info_request_travels_under_login_key() {
    // Arrange
    let keys = SessionKeys::from_pairing_secret("0123456789abcdef");
    let counter = SequenceCounter::new();
    let frame = Frame::new(counter.next(), 0, Code::DeviceInfo, Vec::new());

    // Act
    let (flag, received) = transfer(&frame, Code::DeviceInfo.outbound_security_flag(), &keys);

    // Assert
    assert_eq!(flag, SecurityFlag::Login);
    assert_eq!(received, frame);
    assert_eq!(received.seq, 1);
}

#[test]
fn test_pairing_request_needs_device_info_first() {
    let mut keys = SessionKeys::from_pairing_secret("0123456789abcdef");
    let payload = build_pairing_request("uuid-0001", keys.local_key(), "device-01");
    let frame = Frame::new(2, 0, Code::Pair, payload);

    assert_eq!(
        seal(&frame, Code::Pair.outbound_security_flag(), &keys),
        Err(ProtocolError::KeyUnavailable(SecurityFlag::Session))
    );

    keys.apply_device_info(&device_info());
    let (flag, received) = transfer(&frame, SecurityFlag::Session, &keys);
    assert_eq!(flag, SecurityFlag::Session);
    assert_eq!(received.payload.len(), 44);
}

#[test]
fn test_device_info_response_round_trip_through_auth_key() {
    // The device answers the device-info request; the host parses it and
    // afterwards can read frames sealed with the auth key it carried.
    let mut keys = SessionKeys::from_pairing_secret("0123456789abcdef");
    let response = Frame::new(1, 1, Code::DeviceInfo, device_info().to_bytes());

    let (_, received) = transfer(&response, SecurityFlag::Login, &keys);
    let info = DeviceInfo::parse(&received.payload).expect("device info must parse");
    keys.apply_device_info(&info);

    let status = Frame::new(3, 2, Code::DeviceStatus, vec![0]);
    let (flag, received) = transfer(&status, SecurityFlag::Auth, &keys);
    assert_eq!(flag, SecurityFlag::Auth);
    assert_eq!(received, status);
}

#[test]
fn test_datapoint_write_reaches_peer_and_updates_its_store() {
    // Arrange – the host batches two writes
    let mut keys = SessionKeys::from_pairing_secret("0123456789abcdef");
    keys.apply_device_info(&device_info());
    let mut host = DatapointStore::new();
    host.begin_batch();
    host.set_value(1, DatapointValue::Bool(true)).unwrap();
    host.set_value(2, DatapointValue::enumeration(70_000).unwrap()).unwrap();
    let ids = host.end_batch().expect("batch must flush");

    // Act – send as SendDps, the peer reinterprets the payload as a report
    let payload = encode_datapoints(&host.collect(&ids)).unwrap();
    let frame = Frame::new(4, 0, Code::SendDps, payload);
    let (_, received) = transfer(&frame, SecurityFlag::Session, &keys);
    let report = parse_inbound(Code::ReceiveDp, &received.payload, chrono::Utc::now())
        .unwrap()
        .unwrap();

    // Assert
    assert_eq!(
        report.updates,
        vec![(1, DatapointValue::Bool(true)), (2, DatapointValue::Enum(70_000))]
    );
}

#[test]
fn test_tampered_ciphertext_is_rejected() {
    let mut keys = SessionKeys::from_pairing_secret("0123456789abcdef");
    keys.apply_device_info(&device_info());
    let frame = Frame::new(9, 0, Code::DeviceStatus, Vec::new());
    let mut envelope = seal(&frame, SecurityFlag::Session, &keys).unwrap();
    let last = envelope.len() - 1;
    envelope[last] ^= 0x01;

    assert!(open(&envelope, &keys).is_err());
}
