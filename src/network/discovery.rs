// src/network/discovery.rs
//
// Discovery backends hand the manager a stream of found/lost services.

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{LocalConfig, StaticServiceConfig};
use crate::error::{LocalCommError, Result};

/// One advertised endpoint. Two records are the same service when name,
/// address and port match; the interface is informational.
#[derive(Debug, Clone)]
pub struct DiscoveryService {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub interface: String,
}

impl DiscoveryService {
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16, interface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address,
            port,
            interface: interface.into(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn is_loopback(&self) -> bool {
        self.address.is_loopback()
    }
}

impl PartialEq for DiscoveryService {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.address == other.address && self.port == other.port
    }
}
impl Eq for DiscoveryService {}

impl Hash for DiscoveryService {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for DiscoveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{} ({})", self.name, self.address, self.port, self.interface)
    }
}

impl TryFrom<&StaticServiceConfig> for DiscoveryService {
    type Error = LocalCommError;
    fn try_from(cfg: &StaticServiceConfig) -> Result<Self> {
        let address: IpAddr = cfg.address.parse().map_err(|e| {
            LocalCommError::Config(format!("invalid address '{}': {}", cfg.address, e))
        })?;
        Ok(Self::new(
            cfg.name.clone(),
            address,
            cfg.port,
            cfg.interface.clone().unwrap_or_else(|| "static".into()),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Discovered(DiscoveryService),
    Lost(DiscoveryService),
}

/// Contract of a discovery backend. `start` returns the event stream consumed
/// by the manager's discovery task; repeats of an already reported service
/// are filtered by the backend.
#[async_trait]
pub trait Discover: Send + Sync {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>>;
    async fn stop(&self) -> Result<()>;
    fn is_running(&self) -> bool;
}

#[derive(Default)]
struct ManualState {
    known: Vec<DiscoveryService>,
    tx: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
}

/// Backend driven by explicit `publish` / `withdraw` calls. Services published
/// while stopped are replayed on `start`.
#[derive(Clone, Default)]
pub struct ManualDiscover {
    state: Arc<Mutex<ManualState>>,
}

impl ManualDiscover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_services(services: impl IntoIterator<Item = DiscoveryService>) -> Self {
        let d = Self::new();
        for s in services {
            d.publish(s);
        }
        d
    }

    /// Returns false when the service was already known.
    pub fn publish(&self, service: DiscoveryService) -> bool {
        let mut st = self.state.lock();
        if st.known.contains(&service) {
            return false;
        }
        st.known.push(service.clone());
        if let Some(tx) = &st.tx {
            let _ = tx.send(DiscoveryEvent::Discovered(service));
        }
        true
    }

    /// Returns false when the service was not known.
    pub fn withdraw(&self, service: &DiscoveryService) -> bool {
        let mut st = self.state.lock();
        let Some(pos) = st.known.iter().position(|s| s == service) else {
            return false;
        };
        let removed = st.known.remove(pos);
        if let Some(tx) = &st.tx {
            let _ = tx.send(DiscoveryEvent::Lost(removed));
        }
        true
    }

    pub fn services(&self) -> Vec<DiscoveryService> {
        self.state.lock().known.clone()
    }
}

#[async_trait]
impl Discover for ManualDiscover {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.state.lock();
        for s in &st.known {
            let _ = tx.send(DiscoveryEvent::Discovered(s.clone()));
        }
        st.tx = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        self.state.lock().tx = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().tx.is_some()
    }
}

/// Backend that reports the `[local.static_services]` entries once per start.
pub struct StaticDiscover {
    inner: ManualDiscover,
}

impl StaticDiscover {
    pub fn from_config(cfg: &LocalConfig) -> Result<Self> {
        let services = cfg
            .static_services
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(DiscoveryService::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            inner: ManualDiscover::with_services(services),
        })
    }
}

#[async_trait]
impl Discover for StaticDiscover {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        self.inner.start().await
    }
    async fn stop(&self) -> Result<()> {
        self.inner.stop().await
    }
    fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}

/// Turns DNS-SD browse events into found/lost services. One resolved instance
/// yields one service per advertised address.
pub struct MdnsBrowser {
    service_type: String,
    resolved: HashMap<String, Vec<DiscoveryService>>,
}

impl MdnsBrowser {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            resolved: HashMap::new(),
        }
    }

    /// `lamp._localcomm._tcp.local.` -> `lamp`
    fn instance_name<'a>(&self, fullname: &'a str) -> &'a str {
        fullname
            .strip_suffix(self.service_type.as_str())
            .map(|n| n.trim_end_matches('.'))
            .filter(|n| !n.is_empty())
            .unwrap_or(fullname)
    }

    fn services_of(&self, info: &ServiceInfo) -> Vec<DiscoveryService> {
        let name = self.instance_name(info.get_fullname());
        let mut addrs: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
        addrs.sort();
        addrs
            .into_iter()
            .map(|ip| DiscoveryService::new(name, ip, info.get_port(), "mdns"))
            .collect()
    }

    pub fn handle(&mut self, event: ServiceEvent) -> Vec<DiscoveryEvent> {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let services = self.services_of(&info);
                let known = self
                    .resolved
                    .entry(info.get_fullname().to_string())
                    .or_default();
                let mut out = Vec::new();
                for s in services {
                    if !known.contains(&s) {
                        known.push(s.clone());
                        out.push(DiscoveryEvent::Discovered(s));
                    }
                }
                out
            }
            ServiceEvent::ServiceRemoved(_, fullname) => self
                .resolved
                .remove(&fullname)
                .unwrap_or_default()
                .into_iter()
                .map(DiscoveryEvent::Lost)
                .collect(),
            _ => Vec::new(),
        }
    }
}

struct MdnsSession {
    daemon: ServiceDaemon,
    task: JoinHandle<()>,
}

/// Backend browsing the LAN over multicast DNS. The daemon is only created on `start`.
pub struct MdnsDiscover {
    service_type: String,
    session: Mutex<Option<MdnsSession>>,
}

impl MdnsDiscover {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            session: Mutex::new(None),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }
}

#[async_trait]
impl Discover for MdnsDiscover {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(LocalCommError::Discovery("mdns browse already running".into()));
        }
        let daemon = ServiceDaemon::new()
            .map_err(|e| LocalCommError::Discovery(format!("mdns daemon: {}", e)))?;
        let browse = daemon
            .browse(&self.service_type)
            .map_err(|e| LocalCommError::Discovery(format!("mdns browse {}: {}", self.service_type, e)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut browser = MdnsBrowser::new(self.service_type.clone());
        let task = tokio::spawn(async move {
            while let Ok(event) = browse.recv_async().await {
                for evt in browser.handle(event) {
                    if tx.send(evt).is_err() {
                        return;
                    }
                }
            }
        });
        *session = Some(MdnsSession { daemon, task });
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        session.task.abort();
        let _ = session.daemon.stop_browse(&self.service_type);
        session
            .daemon
            .shutdown()
            .map(|_| ())
            .map_err(|e| LocalCommError::Discovery(format!("mdns shutdown: {}", e)))
    }

    fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }
}

/// Build the backend named by `[local] discovery`.
pub fn discover_from_config(cfg: &LocalConfig) -> Result<Arc<dyn Discover>> {
    match cfg.discovery_backend().to_ascii_lowercase().as_str() {
        "static" => Ok(Arc::new(StaticDiscover::from_config(cfg)?)),
        "mdns" | "dnssd" => Ok(Arc::new(MdnsDiscover::new(cfg.mdns_service_type()))),
        "manual" => Ok(Arc::new(ManualDiscover::new())),
        other => Err(LocalCommError::Discovery(format!(
            "unsupported discovery backend '{}'",
            other
        ))),
    }
}
