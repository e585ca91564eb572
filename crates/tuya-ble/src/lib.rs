//! tuya-ble library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does tuya-ble do? (for beginners)
//!
//! Tuya BLE devices (thermostats, valves, sensors, fingerbots, …) expose
//! their state as numbered *datapoints*.  A host reads and writes those
//! datapoints over an encrypted Bluetooth Low Energy link.  This crate is the
//! host side of that conversation:
//!
//! 1. Look up the device's pairing credentials through a `CredentialResolver`.
//! 2. Open a link through a `BleTransport` and subscribe to notifications.
//! 3. Run the handshake: request device info (which yields the session key),
//!    then send the pairing request.
//! 4. Send commands (status request, datapoint writes) and match each reply
//!    to its request by sequence number.
//! 5. Receive datapoint pushes from the device, update the local datapoint
//!    store, notify callbacks and acknowledge the push.
//! 6. Reconnect with backoff if the link drops unexpectedly.
//!
//! Framing, encryption and the datapoint model live in `tuya_ble_core`; this
//! crate adds everything that involves time, I/O and concurrency.

/// Application layer: the device engine and the ports it is built against.
pub mod application;

/// Infrastructure layer: configuration, credential store and transports.
pub mod infrastructure;

pub use application::config::EngineConfig;
pub use application::connection::ConnectionState;
pub use application::credentials::{CredentialResolver, DeviceCredentials};
pub use application::device::{Device, DeviceError};
pub use application::listeners::Subscription;
pub use application::transport::{BleTransport, TransportError, TransportEvent};
