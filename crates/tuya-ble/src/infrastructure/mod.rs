//! Infrastructure layer of the engine.
//!
//! Contains the adapters the application layer is built against: the
//! credential directory and configuration file, and a transport.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `tuya_ble_core`, but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`storage`** – TOML configuration (`[engine]` settings plus a
//!   `[[devices]]` table) and `StaticCredentialStore`, an in-memory
//!   `CredentialResolver` built from it.
//!
//! - **`transport`** – `SimulatedPeripheral`, a `BleTransport` that plays the
//!   device side of the protocol in memory.  A transport for a real BLE stack
//!   plugs in through the same trait.

pub mod storage;
pub mod transport;
