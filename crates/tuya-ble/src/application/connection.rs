//! Connection lifecycle state machine.
//!
//! ```text
//!  Disconnected ──ConnectRequested──► Connecting ──LinkUp──► AwaitingDeviceInfo
//!       ▲                                                         │
//!       │                                              DeviceInfoReceived
//!       │                                                         ▼
//!       │           Paired ◄──────PairAcknowledged────── AwaitingPairAck
//!       │             │
//!       │     DisconnectRequested (from any connected state)
//!       │             ▼
//!       └──LinkLost── Disconnecting
//! ```
//!
//! `LinkLost` leads back to `Disconnected` from every state.  Events that
//! do not apply to the current state are rejected, so data can never be
//! sent on a link that has not completed the handshake.

use std::fmt;

/// Where a device link currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingDeviceInfo,
    AwaitingPairAck,
    Paired,
    Disconnecting,
}

/// Inputs that move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectRequested,
    LinkUp,
    DeviceInfoReceived,
    PairAcknowledged,
    DisconnectRequested,
    LinkLost,
}

impl ConnectionState {
    /// Returns the state reached by applying `event`, or `None` if the event
    /// is not valid here.
    pub fn on(self, event: LinkEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use LinkEvent::*;

        match (self, event) {
            (Disconnected, ConnectRequested) => Some(Connecting),
            (Connecting, LinkUp) => Some(AwaitingDeviceInfo),
            (AwaitingDeviceInfo, DeviceInfoReceived) => Some(AwaitingPairAck),
            (AwaitingPairAck, PairAcknowledged) => Some(Paired),
            (Disconnected, DisconnectRequested) => None,
            (_, DisconnectRequested) => Some(Disconnecting),
            (_, LinkLost) => Some(Disconnected),
            _ => None,
        }
    }

    /// Whether the handshake has completed on the current link.
    pub fn is_paired(self) -> bool {
        self == ConnectionState::Paired
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingDeviceInfo => "awaiting device info",
            ConnectionState::AwaitingPairAck => "awaiting pair ack",
            ConnectionState::Paired => "paired",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}
