//! Application layer of the engine.
//!
//! # What lives here?
//!
//! - **`device`** – The [`device::Device`] engine: link establishment with
//!   retries, the DeviceInfo/Pair handshake, request/response correlation,
//!   datapoint writes and automatic reconnect.
//!
//! - **`inbound`** – Reassembly, decryption and dispatch of frames pushed by
//!   the device, including datapoint acknowledgements and time replies.
//!
//! - **`connection`** – The connection lifecycle state machine.
//!
//! - **`pending`** – Outstanding requests keyed by sequence number.
//!
//! - **`listeners`** – Connected / datapoints / disconnected callbacks.
//!
//! - **`transport`** and **`credentials`** – The two ports the engine is
//!   built against.  Implementations live in `infrastructure`.
//!
//! - **`config`** – Timeouts, retry counts and other tuning knobs.

pub mod config;
pub mod connection;
pub mod credentials;
pub mod device;
mod inbound;
pub mod listeners;
pub mod pending;
pub mod transport;
