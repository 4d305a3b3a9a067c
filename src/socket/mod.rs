//! Long-lived socket client with automatic reconnection and heartbeat.

pub mod client;
pub mod message;
pub mod mock;
pub mod transport;

pub use client::{MessageCallback, SocketClient};
pub use message::{InboundMessage, MessageFilter};
pub use transport::{Transport, TransportConnection, TransportEvent, TransportSink, WsTransport};

use serde::Serialize;

/// Lifecycle of the persistent connection.
///
/// ```text
/// Idle -> Connecting -> Open -> Reconnecting -> Connecting -> ...
///                         \          \
///                          +-> Closed <+  (explicit close, or attempts exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// A driver task is alive in these states.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Reconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
