use crate::constants::*;
use crate::error::{LocalCommError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Identity of the service process that owns the local clients.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Full service id, `srvId/usrId/instId`
    pub full_id: String,
    /// Human readable name used in logs
    pub name: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            full_id: "localcomm/anonymous/0".to_string(),
            name: Some(DEFAULT_APP_NAME.to_string()),
        }
    }
}

/// Statically configured endpoint, fed to the `static` discovery backend.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticServiceConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LocalConfig {
    /// Skip discovered services whose address is not loopback
    pub only_localhost: Option<bool>,
    /// Never fall back to plaintext
    pub only_ssl: Option<bool>,
    /// Never attempt TLS
    pub only_no_ssl: Option<bool>,
    /// Exchange certificate ids right after the TLS handshake
    pub ssl_sharing_enabled: Option<bool>,
    /// Discovery backend selector: `static` | `mdns` | `manual`
    pub discovery: Option<String>,
    pub static_services: Option<Vec<StaticServiceConfig>>,
    /// DNS-SD service type browsed by the `mdns` backend
    pub mdns_service_type: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub cert_sharing_timeout_ms: Option<u64>,
    pub identity_read_timeout_ms: Option<u64>,
    /// Upper bound for the discovery task waiting on one attempt
    pub connect_wait_timeout_ms: Option<u64>,
    /// Skip backup promotion for disconnects caused by `stop()`
    pub suppress_failover_on_shutdown: Option<bool>,
}

impl LocalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.only_ssl() && self.only_no_ssl() {
            return Err(LocalCommError::Config(
                "Only one of 'onlySSL' or 'onlyNoSSL' can be enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn only_localhost(&self) -> bool {
        self.only_localhost.unwrap_or(false)
    }
    pub fn only_ssl(&self) -> bool {
        self.only_ssl.unwrap_or(false)
    }
    pub fn only_no_ssl(&self) -> bool {
        self.only_no_ssl.unwrap_or(false)
    }
    pub fn ssl_sharing_enabled(&self) -> bool {
        self.ssl_sharing_enabled.unwrap_or(true)
    }
    pub fn discovery_backend(&self) -> String {
        self.discovery
            .clone()
            .unwrap_or_else(|| DEFAULT_DISCOVERY_BACKEND.to_string())
    }
    pub fn mdns_service_type(&self) -> String {
        self.mdns_service_type
            .clone()
            .unwrap_or_else(|| DEFAULT_MDNS_SERVICE_TYPE.to_string())
    }
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(CONNECT_TIMEOUT)
    }
    pub fn cert_sharing_timeout(&self) -> Duration {
        self.cert_sharing_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(CERT_SHARING_TIMEOUT)
    }
    pub fn identity_read_timeout(&self) -> Duration {
        self.identity_read_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(IDENTITY_READ_TIMEOUT)
    }
    pub fn connect_wait_timeout(&self) -> Duration {
        self.connect_wait_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(CONNECT_WAIT_TIMEOUT)
    }
    pub fn suppress_failover_on_shutdown(&self) -> bool {
        self.suppress_failover_on_shutdown.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct KeystoreConfig {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// Defaults to `<full_id>-LocalCert`
    pub alias: Option<String>,
    /// Subject CN of a generated certificate. Defaults to the service full id.
    pub common_name: Option<String>,
}

impl KeystoreConfig {
    pub fn cert_path(&self) -> String {
        self.cert_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CERT_PATH.to_string())
    }
    pub fn key_path(&self) -> String {
        self.key_path
            .clone()
            .unwrap_or_else(|| DEFAULT_KEY_PATH.to_string())
    }
    pub fn alias(&self, full_id: &str) -> String {
        match self.alias.as_deref() {
            Some(a) if !a.is_empty() => a.to_string(),
            _ => format!("{}{}", full_id, LOCAL_CERT_ALIAS_SUFFIX),
        }
    }
    pub fn common_name(&self, full_id: &str) -> String {
        self.common_name
            .clone()
            .unwrap_or_else(|| full_id.to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TrustConfig {
    /// mode: open | tofu | allowlist
    pub mode: Option<String>,
    /// Certificates accepted up front (PEM files)
    pub trusted_cert_dir: Option<String>,
    /// Directory where newly observed certificates are written
    pub observed_dir: Option<String>,
    /// Allowed SPKI fingerprints (hex lowercase); empty means no pinning
    pub pin_fingerprints: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Path to JSON line event log (rotated). If unset, defaults to logs/localcomm.jsonl
    pub json_path: Option<String>,
    /// Max size in bytes before rotation (default 5MB)
    pub json_max_bytes: Option<usize>,
    /// Number of rotated files to retain (default 3)
    pub json_rotate: Option<u32>,
    /// Disable console sink (default false)
    pub disable_console: Option<bool>,
    /// Minimum console level: trace | debug | info | warn | error (default info)
    pub console_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub keystore: KeystoreConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: Config =
            toml::from_str(content).map_err(|e| LocalCommError::Config(e.to_string()))?;
        cfg.local.validate()?;
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LocalCommError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&content)
    }
}
