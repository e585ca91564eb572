//! Device-state entities: typed datapoints and the per-device store.
//!
//! # What is a datapoint? (for beginners)
//!
//! Devices speaking this protocol expose their whole state as a small set of
//! numbered slots called datapoints.  A light might use id 1 for on/off (a
//! `Bool`), id 3 for brightness (a `Value`) and id 2 for its mode (an
//! `Enum`).  Reading state means waiting for the device to report
//! datapoints; changing state means writing datapoints back.
//!
//! Nothing in this module knows about Bluetooth, encryption or frames.  The
//! protocol layer turns bytes into [`datapoint::DatapointValue`]s and the
//! engine crate decides when to send them.

pub mod datapoint;
pub mod store;
