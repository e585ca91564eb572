//! # tuya-ble-core
//!
//! Transport-independent half of the Tuya BLE datapoint protocol: the frame
//! codec, encryption and key derivation, fragmentation, and the datapoint
//! model.
//!
//! This crate performs no I/O.  It has no async runtime and no notion of a
//! Bluetooth adapter; everything here is a pure function of bytes in and
//! bytes out, which keeps it trivially unit-testable.
//!
//! # Architecture overview (for beginners)
//!
//! A Tuya BLE device exposes its state as numbered *datapoints* and talks
//! over a single pair of GATT characteristics with a 20-byte write size.
//! Sending one logical message therefore takes several steps:
//!
//! ```text
//!   Frame { seq, response_to, code, payload }
//!     │  encode_frame      header + payload + CRC-16, zero-padded to 16
//!     │  seal              [security flag][IV][AES-CBC ciphertext]
//!     │  split_packets     20-byte packets with a varint index
//!     ▼
//!   GATT writes
//! ```
//!
//! Receiving runs the same pipeline backwards through a [`Reassembler`],
//! [`open`](protocol::codec::open) and [`decode_frame`].
//!
//! - **`protocol`** – message codes, the codec, fragmentation, the sequence
//!   counter, advertisement decoding and time-sync payloads.
//!
//! - **`crypto`** – AES-CBC, MD5 key derivation and the per-session key set.
//!
//! - **`domain`** – typed datapoints and the per-device datapoint store.

pub mod crypto;
pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `tuya_ble_core::Frame` instead of `tuya_ble_core::protocol::codec::Frame`.
pub use crypto::SessionKeys;
pub use domain::datapoint::{Datapoint, DatapointError, DatapointType, DatapointValue};
pub use domain::store::DatapointStore;
pub use protocol::codec::{decode_frame, encode_frame, Frame, ProtocolError};
pub use protocol::fragment::Reassembler;
pub use protocol::messages::{Code, SecurityFlag};
