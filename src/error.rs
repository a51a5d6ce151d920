use thiserror::Error;

pub type Result<T, E = LocalCommError> = std::result::Result<T, E>;

/// Errors surfaced by the local communication layer.
#[derive(Debug, Error)]
pub enum LocalCommError {
    /// Invalid settings; the manager is not usable.
    #[error("configuration error: {0}")]
    Config(String),
    /// A lifecycle operation was invoked in a state that forbids it.
    #[error("state error: {0}")]
    State(String),
    /// Socket or TLS negotiation failure for one attempt.
    #[error("connection error: {0}")]
    Connection(String),
    /// Missing or malformed identity presentation.
    #[error("identity error: {0}")]
    Identity(String),
    /// The object registry refused to bind the connection.
    #[error("registry error: {0}")]
    Registry(String),
    /// The discovery backend failed to start or stop.
    #[error("discovery error: {0}")]
    Discovery(String),
    #[error("Can't set RemoteObject twice")]
    AlreadyBound,
    #[error("peer is not connected")]
    NotConnected,
    #[error("tls error: {0}")]
    Tls(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LocalCommError {
    /// Short label used in structured events.
    pub fn kind(&self) -> &'static str {
        match self {
            LocalCommError::Config(_) => "config",
            LocalCommError::State(_) => "state",
            LocalCommError::Connection(_) => "connection",
            LocalCommError::Identity(_) => "identity",
            LocalCommError::Registry(_) => "registry",
            LocalCommError::Discovery(_) => "discovery",
            LocalCommError::AlreadyBound => "already_bound",
            LocalCommError::NotConnected => "not_connected",
            LocalCommError::Tls(_) => "tls",
            LocalCommError::Io(_) => "io",
        }
    }
}
