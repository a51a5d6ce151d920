use serde::Serialize;
use std::time::SystemTime;

/// Severity, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    pub ts: SystemTime,
    pub level: LogLevel,
    pub corr_id: Option<String>,
    pub session_id: String,
    pub component: &'static str,
    pub suppress_console: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrustDecisionEvent {
    pub meta: EventMeta,
    pub role: ConnectionRole,
    pub decision: String,
    pub reason: String,
    pub mode: String,
    pub fingerprint: Option<String>,
    pub subject: Option<String>,
    pub stored: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEvent {
    pub meta: EventMeta,
    pub action: String,
    pub addr: Option<String>,
    pub detail: Option<String>,
}

/// State change or lifecycle step of one local client, tagged with its manager-local id.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub meta: EventMeta,
    pub luid: Option<u32>,
    pub action: String,
    pub local_id: String,
    pub remote_id: String,
    pub state: String,
    pub reason: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryEvent {
    pub meta: EventMeta,
    pub luid: Option<u32>,
    pub action: String,
    pub service: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub meta: EventMeta,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    TrustDecision(TrustDecisionEvent),
    Network(NetworkEvent),
    Connection(ConnectionEvent),
    Discovery(DiscoveryEvent),
    System(SystemEvent),
}

impl LogEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            LogEvent::TrustDecision(e) => &e.meta,
            LogEvent::Network(e) => &e.meta,
            LogEvent::Connection(e) => &e.meta,
            LogEvent::Discovery(e) => &e.meta,
            LogEvent::System(e) => &e.meta,
        }
    }
}
