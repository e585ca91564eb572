//! Storage infrastructure: configuration file and credential directory.
//!
//! - **`config`** – Reads and writes `AppConfig` as TOML.  Missing fields fall
//!   back to serde defaults, so an empty file is a valid configuration.
//! - **`credentials`** – `StaticCredentialStore`, the address → credentials
//!   lookup the engine queries before connecting.

pub mod config;
pub mod credentials;
