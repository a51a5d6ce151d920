//! Central place for application-wide constants and default values.

use std::time::Duration;

/// Default application name (can be overridden in config)
pub const DEFAULT_APP_NAME: &str = "LocalComm";

/// Left padding used to align log lines with those that include emoji prefixes.
/// Keep this to a fixed width matching the emoji prefix you use elsewhere.
pub const ICON_PLACEHOLDER: &str = "   "; // Three spaces for alignment

/// Application / crate version (populated from Cargo.toml via env! macro)
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Marker prefixing the certificate-sharing line exchanged right after the TLS handshake.
pub const CERT_SHARING_PREFIX: &str = "$cert:";

/// How long a side waits for the peer's certificate-sharing line before moving on.
pub const CERT_SHARING_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the TCP connect and on the secure handshake of a single attempt.
/// Certificate sharing is granted its own timeout on top of it.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on reading the identity presentation line.
pub const IDENTITY_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the discovery task waiting for one connection attempt to report CONNECT or FAIL.
pub const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_secs(45);

/// Bound on `stop()` waiting for disconnect processing to drain.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Keystore defaults carried over from the service settings.
pub const DEFAULT_CERT_PATH: &str = "./local_cert.pem";
pub const DEFAULT_KEY_PATH: &str = "./local_key.pem";
pub const LOCAL_CERT_ALIAS_SUFFIX: &str = "-LocalCert";

/// Discovery backend selected when the config leaves it unset.
pub const DEFAULT_DISCOVERY_BACKEND: &str = "static";

/// DNS-SD type objects advertise their local server under.
pub const DEFAULT_MDNS_SERVICE_TYPE: &str = "_localcomm._tcp.local.";

/// Human friendly composite version string used in logs.
pub fn full_version() -> String {
    format!("v{}", APP_VERSION)
}

/// Log tag for a connection attempt, e.g. `[C#: 0004]`.
pub fn client_tag(luid: u32) -> String {
    format!("[C#: {:04x}]", luid)
}

/// Log tag for a discovered service, e.g. `[D#: 000a]`.
pub fn discovery_tag(luid: u32) -> String {
    format!("[D#: {:04x}]", luid)
}
