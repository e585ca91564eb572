//! Boundary to the host BLE stack.
//!
//! The engine never talks to a Bluetooth adapter directly.  It is handed a
//! [`BleTransport`] for one peripheral: something that can open a link,
//! subscribe to the notify characteristic, write to the write
//! characteristic and close the link again.  Inbound notifications and link
//! loss are reported as [`TransportEvent`]s on the channel passed to
//! [`BleTransport::connect`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The link could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// An operation needed an open link and there was none.
    #[error("not connected")]
    NotConnected,

    /// A characteristic write failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The peripheral is not in range or not known to the adapter.
    #[error("device not found")]
    NotFound,
}

/// What the transport reports back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One notification from the notify characteristic, in arrival order.
    Notification(Vec<u8>),
    /// The link went away.
    Disconnected,
}

/// A link to one BLE peripheral.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Opens the link.  Events for this link are sent on `events` until it
    /// is closed.
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Enables notifications on the notify characteristic.
    async fn subscribe(&self) -> Result<(), TransportError>;

    /// Writes one packet (at most one MTU) to the write characteristic.
    async fn write(&self, packet: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}
