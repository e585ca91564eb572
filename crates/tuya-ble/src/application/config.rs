//! Engine tuning knobs.
//!
//! Every field has a serde default, so an empty `[engine]` table (or none
//! at all) yields the values below.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tuya_ble_core::protocol::messages::GATT_MTU;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a request waits for its correlated response.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Link establishment attempts before giving up with "not reachable".
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Pause between failed attempts.
    #[serde(default)]
    pub connect_retry_delay_ms: u64,
    #[serde(default = "default_reconnect_backoff_initial_ms")]
    pub reconnect_backoff_initial_ms: u64,
    #[serde(default = "default_reconnect_backoff_max_ms")]
    pub reconnect_backoff_max_ms: u64,
    /// Largest packet written to the link.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Links allowed to be in establishment at once, across all devices.
    #[serde(default = "default_max_concurrent_connects")]
    pub max_concurrent_connects: usize,
    /// Pause after a fresh handshake before the first status request.
    #[serde(default = "default_session_settle_ms")]
    pub session_settle_ms: u64,
    /// `tracing` level used by the binary when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_response_timeout_ms() -> u64 {
    60_000
}
fn default_connect_attempts() -> u32 {
    100
}
fn default_reconnect_backoff_initial_ms() -> u64 {
    2_000
}
fn default_reconnect_backoff_max_ms() -> u64 {
    60_000
}
fn default_mtu() -> usize {
    GATT_MTU
}
fn default_max_concurrent_connects() -> usize {
    1
}
fn default_session_settle_ms() -> u64 {
    500
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: 0,
            reconnect_backoff_initial_ms: default_reconnect_backoff_initial_ms(),
            reconnect_backoff_max_ms: default_reconnect_backoff_max_ms(),
            mtu: default_mtu(),
            max_concurrent_connects: default_max_concurrent_connects(),
            session_settle_ms: default_session_settle_ms(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn reconnect_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_initial_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }

    pub fn session_settle(&self) -> Duration {
        Duration::from_millis(self.session_settle_ms)
    }
}
