// src/network/listener.rs
//
// Object side of a local connection: accepts service clients, negotiates the
// secure channel and runs the identity line exchange.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::constants::*;
use crate::error::{LocalCommError, Result};
use crate::events::model::LogLevel;
use crate::network::discovery::DiscoveryService;
use crate::network::events::emit_network_event;
use crate::network::identity::{DefaultIdentityValidator, IdentityValidator};
use crate::network::peer::{Peer, PeerConnectionListener};
use crate::security::secure_channel::{PlaintextChannel, SecureChannel, TlsMaterial, TlsSecureChannel};

fn log_network_event(level: LogLevel, action: &str, addr: Option<String>, detail: Option<String>) {
    emit_network_event("listener", level, action, addr, detail);
}

pub struct ObjectServerConfig {
    /// Full object id presented to services.
    pub object_id: String,
    pub bind: SocketAddr,
    /// Plaintext when unset.
    pub tls: Option<Arc<TlsMaterial>>,
    pub sharing: bool,
    pub sharing_timeout: Duration,
    pub identity_timeout: Duration,
    pub validator: Arc<dyn IdentityValidator>,
}

impl ObjectServerConfig {
    /// Plaintext server on an ephemeral loopback port.
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            tls: None,
            sharing: true,
            sharing_timeout: CERT_SHARING_TIMEOUT,
            identity_timeout: IDENTITY_READ_TIMEOUT,
            validator: Arc::new(DefaultIdentityValidator),
        }
    }

    pub fn with_tls(mut self, material: Arc<TlsMaterial>) -> Self {
        self.tls = Some(material);
        self
    }
    pub fn with_sharing(mut self, sharing: bool) -> Self {
        self.sharing = sharing;
        self
    }
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }
    pub fn with_identity_timeout(mut self, wait: Duration) -> Self {
        self.identity_timeout = wait;
        self
    }
}

struct Accepted {
    peer: Peer,
    identified: bool,
}

struct ServerInner {
    cfg: ObjectServerConfig,
    local_addr: SocketAddr,
    channel: Arc<dyn SecureChannel>,
    peers: Mutex<HashMap<u64, Accepted>>,
    listeners: RwLock<Vec<Arc<dyn PeerConnectionListener>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// TCP endpoint of one remote object, reachable by local clients managers.
#[derive(Clone)]
pub struct LocalObjectServer {
    inner: Arc<ServerInner>,
}

impl LocalObjectServer {
    pub async fn start(cfg: ObjectServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(cfg.bind).await?;
        let local_addr = listener.local_addr()?;
        let channel: Arc<dyn SecureChannel> = match &cfg.tls {
            Some(material) => Arc::new(TlsSecureChannel::new(
                material.clone(),
                cfg.sharing,
                cfg.sharing_timeout,
            )),
            None => Arc::new(PlaintextChannel::new()),
        };
        log_network_event(
            LogLevel::Info,
            "listener_bind",
            Some(local_addr.to_string()),
            Some(format!("object={} backend={:?}", cfg.object_id, channel.backend())),
        );
        let inner = Arc::new(ServerInner {
            cfg,
            local_addr,
            channel,
            peers: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            accept_task: Mutex::new(None),
        });
        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(&inner)));
        *inner.accept_task.lock() = Some(task);
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn object_id(&self) -> &str {
        &self.inner.cfg.object_id
    }

    /// Record a discovery backend would publish for this endpoint.
    pub fn discovery_record(&self, name: impl Into<String>) -> DiscoveryService {
        DiscoveryService::new(name, self.inner.local_addr.ip(), self.inner.local_addr.port(), "lo")
    }

    /// Listener attached to every peer accepted from now on.
    pub fn add_peer_listener(&self, listener: Arc<dyn PeerConnectionListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Connected peers whose service id is known.
    pub fn clients(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .inner
            .peers
            .lock()
            .values()
            .filter(|a| a.identified && a.peer.is_connected())
            .map(|a| a.peer.clone())
            .collect();
        peers.sort_by_key(|p| p.id());
        peers
    }

    /// Send `line` to every identified client; returns how many got it.
    pub async fn broadcast(&self, line: &str) -> usize {
        let mut sent = 0;
        for peer in self.clients() {
            if peer.send_line(line).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Stop accepting and close every connection.
    pub async fn stop(&self) {
        let task = self.inner.accept_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let peers: Vec<Peer> = self
            .inner
            .peers
            .lock()
            .values()
            .map(|a| a.peer.clone())
            .collect();
        for peer in peers {
            let _ = peer.disconnect().await;
        }
        log_network_event(
            LogLevel::Info,
            "listener_stopped",
            Some(self.inner.local_addr.to_string()),
            None,
        );
    }
}

async fn accept_loop(listener: TcpListener, server: Weak<ServerInner>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                log_network_event(
                    LogLevel::Debug,
                    "incoming_connection",
                    Some(peer_addr.to_string()),
                    None,
                );
                let Some(inner) = server.upgrade() else {
                    break;
                };
                tokio::spawn(handle_connection(inner, stream, peer_addr));
            }
            Err(e) => {
                log_network_event(LogLevel::Error, "accept_failed", None, Some(e.to_string()));
            }
        }
    }
}

async fn handle_connection(server: Arc<ServerInner>, stream: TcpStream, peer_addr: SocketAddr) {
    let local_addr = stream.local_addr().ok();
    let wait = server.cfg.identity_timeout + server.channel.negotiation_allowance();
    let channel = match tokio::time::timeout(wait, server.channel.accept(stream, peer_addr)).await {
        Ok(Ok(c)) => c,
        Ok(Err(e)) => {
            log_network_event(
                LogLevel::Warn,
                "handshake_failed",
                Some(peer_addr.to_string()),
                Some(e.to_string()),
            );
            return;
        }
        Err(_) => {
            log_network_event(
                LogLevel::Warn,
                "handshake_timeout",
                Some(peer_addr.to_string()),
                None,
            );
            return;
        }
    };

    let peer = Peer::accepted(server.cfg.object_id.clone(), peer_addr, local_addr, channel);
    peer.add_listener(Arc::new(ServerHooks {
        server: Arc::downgrade(&server),
    }));
    for l in server.listeners.read().iter() {
        peer.add_listener(l.clone());
    }
    server.peers.lock().insert(
        peer.id(),
        Accepted {
            peer: peer.clone(),
            identified: false,
        },
    );
    peer.activate();
}

/// Identity exchange and bookkeeping for accepted peers.
struct ServerHooks {
    server: Weak<ServerInner>,
}

impl ServerHooks {
    async fn exchange_identity(&self, server: &ServerInner, peer: &Peer) -> Result<String> {
        let validator = server.cfg.validator.as_ref();
        let auth = peer.auth();
        let tls = server.cfg.tls.is_some();

        let own_full = server
            .channel
            .local_cert_id()
            .map(|id| validator.is_full_object_id(id))
            .unwrap_or(false);
        if !tls || !own_full {
            peer.send_line(&server.cfg.object_id).await?;
        }

        if tls {
            if let Some(id) = auth
                .as_ref()
                .and_then(|a| a.remote_cert_id())
                .filter(|id| validator.is_full_service_id(id))
            {
                return Ok(id.to_string());
            }
        }
        loop {
            let line = peer.read_line(server.cfg.identity_timeout).await?;
            // A sharing marker from a client that shares while we don't.
            if line.starts_with(CERT_SHARING_PREFIX) {
                continue;
            }
            if !validator.is_full_service_id(&line) {
                return Err(LocalCommError::Identity(format!(
                    "'{}' is not a full service id",
                    line
                )));
            }
            return Ok(line);
        }
    }
}

#[async_trait]
impl PeerConnectionListener for ServerHooks {
    async fn on_connect(&self, peer: &Peer) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        match self.exchange_identity(&server, peer).await {
            Ok(service_id) => {
                peer.set_remote_id(service_id.clone());
                if let Some(a) = server.peers.lock().get_mut(&peer.id()) {
                    a.identified = true;
                }
                log_network_event(
                    LogLevel::Info,
                    "service_identified",
                    Some(peer.remote_addr().to_string()),
                    Some(format!("service={}", service_id)),
                );
            }
            Err(e) => {
                log_network_event(
                    LogLevel::Warn,
                    "identity_failed",
                    Some(peer.remote_addr().to_string()),
                    Some(e.to_string()),
                );
                let _ = peer.disconnect().await;
            }
        }
    }

    async fn on_disconnect(&self, peer: &Peer) {
        if let Some(server) = self.server.upgrade() {
            server.peers.lock().remove(&peer.id());
        }
        log_network_event(
            LogLevel::Info,
            "service_disconnected",
            Some(peer.remote_addr().to_string()),
            Some(format!("reason={}", peer.disconnection_reason())),
        );
    }
}
