use serde::Serialize;
use std::fmt;

/// Connection phase of a peer.
///
/// `Connecting`, `WaitingServer` and `Disconnecting` only occur on the side that
/// initiated the connection; `Connected` and `Disconnected` apply to both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    WaitingServer,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connecting(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::WaitingServer)
    }
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
    pub fn is_disconnecting(self) -> bool {
        self == ConnectionState::Disconnecting
    }
    pub fn is_disconnected(self) -> bool {
        self == ConnectionState::Disconnected
    }

    fn rank(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::WaitingServer => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Disconnecting => 3,
            ConnectionState::Disconnected => 4,
        }
    }

    /// Whether `self -> next` is a forward step of the lifecycle.
    pub(crate) fn can_advance_to(self, next: ConnectionState) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::WaitingServer => "WAITING_SERVER",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

/// Why a peer reached `Disconnected`. Set once, at that transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectionReason {
    NotDisconnected,
    LocalRequest,
    RemoteRequest,
    /// TCP connect, TLS handshake or certificate sharing failed.
    ConnectFailed,
    /// The read side failed with an I/O error.
    StreamError,
}

impl fmt::Display for DisconnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectionReason::NotDisconnected => "NOT_DISCONNECTED",
            DisconnectionReason::LocalRequest => "LOCAL_REQUEST",
            DisconnectionReason::RemoteRequest => "REMOTE_REQUEST",
            DisconnectionReason::ConnectFailed => "CONNECT_FAILED",
            DisconnectionReason::StreamError => "STREAM_ERROR",
        };
        f.write_str(s)
    }
}
