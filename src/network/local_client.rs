// src/network/local_client.rs

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{LocalCommError, Result};
use crate::network::clients_manager::{LocalClientsManager, WeakManager};
use crate::network::discovery::DiscoveryService;
use crate::network::identity::IdentityValidator;
use crate::network::peer::{Peer, PeerConnectionListener};
use crate::network::state::{ConnectionState, DisconnectionReason};
use crate::objs::RemoteObject;
use crate::security::secure_channel::SecureChannel;

/// Identity of a connection attempt inside the manager's bookkeeping.
pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tls,
    Plain,
}

/// How much of the two identities the transport itself established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    NoSsl,
    SslNoShare,
    SslSharePartial,
    SslShareFull,
}

impl SecurityLevel {
    pub fn calculate(is_ssl: bool, did_share: bool, is_remote_cert_full: bool) -> Self {
        match (is_ssl, did_share, is_remote_cert_full) {
            (false, _, _) => SecurityLevel::NoSsl,
            (true, false, _) => SecurityLevel::SslNoShare,
            (true, true, false) => SecurityLevel::SslSharePartial,
            (true, true, true) => SecurityLevel::SslShareFull,
        }
    }
}

/// Where a client ended up after its connect callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Pending,
    /// Active connection of its remote object.
    Bound,
    /// Bound, but another client was already active; parked as a backup.
    Backup,
    /// Failed, discarded or disconnected before binding.
    Abandoned,
}

struct LocalClientInner {
    peer: Peer,
    kind: TransportKind,
    service: DiscoveryService,
    secure: Arc<dyn SecureChannel>,
    connect_timeout: Duration,
    local_cert_full: bool,
    security: RwLock<SecurityLevel>,
    remote_object: OnceCell<RemoteObject>,
    manager: WeakManager,
    luid: AtomicU32,
    promoted: AtomicBool,
    demoted: AtomicBool,
    phase: watch::Sender<ClientPhase>,
    hooks: Arc<ClientHooks>,
}

/// One connection attempt from this service to one discovered object endpoint.
#[derive(Clone)]
pub struct LocalClient {
    inner: Arc<LocalClientInner>,
}

impl fmt::Debug for LocalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalClient")
            .field("id", &self.id())
            .field("kind", &self.inner.kind)
            .field("service", &self.inner.service)
            .field("remote_id", &self.remote_id())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for LocalClient {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for LocalClient {}

/// Routes peer callbacks of one client into its manager.
///
/// From `connect()` until the DISCONNECTED callback has run, the hooks hold the
/// client itself, so FAIL and DISCONNECT reach the manager even after every
/// other handle was dropped.
struct ClientHooks {
    client: Weak<LocalClientInner>,
    session: Mutex<Option<LocalClient>>,
}

impl ClientHooks {
    fn resolve(&self) -> Option<(LocalClient, LocalClientsManager)> {
        let client = match self.session.lock().clone() {
            Some(c) => c,
            None => LocalClient {
                inner: self.client.upgrade()?,
            },
        };
        let manager = client.inner.manager.upgrade()?;
        Some((client, manager))
    }

    fn hold(&self, client: LocalClient) {
        *self.session.lock() = Some(client);
    }

    fn release(&self) {
        self.session.lock().take();
    }
}

#[async_trait]
impl PeerConnectionListener for ClientHooks {
    async fn on_connect(&self, _peer: &Peer) {
        if let Some((client, manager)) = self.resolve() {
            manager.on_client_connected(&client).await;
        }
    }

    async fn on_disconnect(&self, _peer: &Peer) {
        if let Some((client, manager)) = self.resolve() {
            manager.on_client_disconnected(&client).await;
        }
        // Last callback of the session.
        self.release();
    }

    async fn on_fail(&self, _peer: &Peer, msg: &str, cause: &LocalCommError) {
        if let Some((client, manager)) = self.resolve() {
            manager.on_client_failed(&client, msg, cause);
        }
    }

    async fn on_data(&self, _peer: &Peer, line: &str) {
        if let Some((client, manager)) = self.resolve() {
            manager.on_client_data(&client, line);
        }
    }
}

impl LocalClient {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        manager: WeakManager,
        kind: TransportKind,
        service: DiscoveryService,
        local_id: &str,
        secure: Arc<dyn SecureChannel>,
        connect_timeout: Duration,
        local_cert_full: bool,
    ) -> Self {
        let peer = Peer::client(
            local_id,
            service.name.clone(),
            service.socket_addr(),
            secure.clone(),
            connect_timeout,
        );
        let (phase, _) = watch::channel(ClientPhase::Pending);
        let inner = Arc::new_cyclic(|weak: &Weak<LocalClientInner>| {
            let hooks = Arc::new(ClientHooks {
                client: weak.clone(),
                session: Mutex::new(None),
            });
            peer.add_listener(hooks.clone());
            LocalClientInner {
                hooks,
                peer: peer.clone(),
                kind,
                service,
                secure,
                connect_timeout,
                local_cert_full,
                security: RwLock::new(match kind {
                    TransportKind::Tls => SecurityLevel::SslNoShare,
                    TransportKind::Plain => SecurityLevel::NoSsl,
                }),
                remote_object: OnceCell::new(),
                manager,
                luid: AtomicU32::new(0),
                promoted: AtomicBool::new(false),
                demoted: AtomicBool::new(false),
                phase,
            }
        });
        Self { inner }
    }

    /// A brand-new client for the same endpoint and transport.
    pub(crate) fn respawn(&self) -> LocalClient {
        LocalClient::new(
            self.inner.manager.clone(),
            self.inner.kind,
            self.inner.service.clone(),
            self.inner.peer.local_id(),
            self.inner.secure.clone(),
            self.inner.connect_timeout,
            self.inner.local_cert_full,
        )
    }

    pub fn id(&self) -> ClientId {
        self.inner.peer.id()
    }
    pub fn peer(&self) -> &Peer {
        &self.inner.peer
    }
    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }
    pub fn is_ssl(&self) -> bool {
        self.inner.kind == TransportKind::Tls
    }
    pub fn service(&self) -> &DiscoveryService {
        &self.inner.service
    }
    pub fn local_id(&self) -> &str {
        self.inner.peer.local_id()
    }
    /// Advertised name until the handshake resolves the object id.
    pub fn remote_id(&self) -> String {
        self.inner.peer.remote_id()
    }
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.peer.remote_addr()
    }
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.peer.local_addr()
    }
    pub fn state(&self) -> ConnectionState {
        self.inner.peer.state()
    }
    pub fn disconnection_reason(&self) -> DisconnectionReason {
        self.inner.peer.disconnection_reason()
    }
    pub fn security_level(&self) -> SecurityLevel {
        *self.inner.security.read()
    }
    /// Whether this side's own certificate id already is a full service id.
    pub fn is_local_cert_full(&self) -> bool {
        self.inner.local_cert_full
    }
    pub fn luid(&self) -> Option<u32> {
        match self.inner.luid.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }
    pub fn manager(&self) -> Option<LocalClientsManager> {
        self.inner.manager.upgrade()
    }

    pub fn remote_object(&self) -> Option<RemoteObject> {
        self.inner.remote_object.get().cloned()
    }

    /// Bind to a remote object. A client is bound at most once.
    pub fn set_remote_object(&self, object: RemoteObject) -> Result<()> {
        self.inner
            .remote_object
            .set(object)
            .map_err(|_| LocalCommError::AlreadyBound)
    }

    pub async fn connect(&self) -> Result<()> {
        self.inner.hooks.hold(self.clone());
        let res = self.inner.peer.connect().await;
        if let Err(LocalCommError::State(_)) = &res {
            // Refused before any session started; no DISCONNECTED will follow.
            self.inner.hooks.release();
        }
        res
    }
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.peer.disconnect().await
    }
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.inner.peer.send(data).await
    }
    pub async fn send_line(&self, line: &str) -> Result<()> {
        self.inner.peer.send_line(line).await
    }
    pub async fn read_line(&self, wait: Duration) -> Result<String> {
        self.inner.peer.read_line(wait).await
    }
    pub fn add_listener(&self, listener: Arc<dyn PeerConnectionListener>) {
        self.inner.peer.add_listener(listener);
    }

    pub fn phase(&self) -> ClientPhase {
        *self.inner.phase.borrow()
    }

    /// Wait until the connect callback bound, parked or abandoned this client.
    pub async fn wait_settled(&self, wait: Duration) -> ClientPhase {
        let mut rx = self.inner.phase.subscribe();
        let settled = tokio::time::timeout(wait, async {
            loop {
                let current = *rx.borrow_and_update();
                if current != ClientPhase::Pending {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return ClientPhase::Abandoned;
                }
            }
        })
        .await;
        settled.unwrap_or(ClientPhase::Pending)
    }

    pub(crate) fn settle(&self, phase: ClientPhase) {
        self.inner.phase.send_if_modified(|current| {
            if *current == ClientPhase::Pending {
                *current = phase;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn set_luid(&self, luid: u32) {
        self.inner.luid.store(luid, Ordering::Relaxed);
    }

    pub(crate) fn update_security(&self, validator: &dyn IdentityValidator) {
        let level = match self.inner.kind {
            TransportKind::Plain => SecurityLevel::NoSsl,
            TransportKind::Tls => {
                let auth = self.inner.peer.auth();
                let did_share = auth.as_ref().map(|a| a.did_share()).unwrap_or(false);
                let remote_full = auth
                    .as_ref()
                    .and_then(|a| a.remote_cert_id())
                    .map(|id| validator.is_full_object_id(id))
                    .unwrap_or(false);
                SecurityLevel::calculate(true, did_share, remote_full)
            }
        };
        *self.inner.security.write() = level;
    }

    pub(crate) fn mark_promoted(&self) {
        self.inner.promoted.store(true, Ordering::Relaxed);
    }
    pub(crate) fn is_promoted(&self) -> bool {
        self.inner.promoted.load(Ordering::Relaxed)
    }
    pub(crate) fn mark_demoted(&self) {
        self.inner.demoted.store(true, Ordering::Relaxed);
    }
    /// Parked as a backup; its socket was closed on purpose.
    pub fn is_backup(&self) -> bool {
        self.inner.demoted.load(Ordering::Relaxed)
    }
}
