// src/network/clients_manager.rs
//
// Turns discovered object endpoints into identified, bound connections.
//
// Discovery events are consumed by one task, one service at a time. Each
// connection attempt then lives on its own peer session: the connect
// callback resolves the remote identity, binds the client to its remote
// object and decides whether it becomes the active connection or a backup.
// All bookkeeping maps live behind one lock so a client is always added to
// or removed from every map at once.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{Config, LocalConfig};
use crate::constants::{client_tag, discovery_tag, SHUTDOWN_DRAIN_TIMEOUT};
use crate::error::{LocalCommError, Result};
use crate::events::dispatcher;
use crate::events::model::{LogEvent, LogLevel, SystemEvent};
use crate::network::discovery::{discover_from_config, Discover, DiscoveryEvent, DiscoveryService};
use crate::network::events::{emit_connection_event, emit_discovery_event, emit_network_event, ConnectionTag};
use crate::network::identity::{DefaultIdentityValidator, IdentityValidator};
use crate::network::local_client::{ClientId, ClientPhase, LocalClient, TransportKind};
use crate::objs::{InMemoryRegistry, ObjectRegistry, RemoteObject};
use crate::security::certs::LocalCertificate;
use crate::security::secure_channel::{PlaintextChannel, SecureChannel, TlsMaterial, TlsSecureChannel};
use crate::security::trust::{EffectiveTrustPolicy, TrustManager};

pub type ListenerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    Stop,
    Starting,
    RunWaiting,
    ShuttingDown,
}

impl LocalState {
    pub fn is_running(self) -> bool {
        self == LocalState::RunWaiting
    }

    /// `Ok(true)` when `start()` has work to do, `Ok(false)` when it is a no-op.
    pub fn plan_start(self) -> Result<bool> {
        match self {
            LocalState::Stop => Ok(true),
            LocalState::Starting | LocalState::RunWaiting => Ok(false),
            LocalState::ShuttingDown => Err(LocalCommError::State(
                "can't start while shutting down".into(),
            )),
        }
    }

    /// `Ok(true)` when `stop()` has work to do, `Ok(false)` when it is a no-op.
    pub fn plan_stop(self) -> Result<bool> {
        match self {
            LocalState::RunWaiting => Ok(true),
            LocalState::Stop | LocalState::ShuttingDown => Ok(false),
            LocalState::Starting => Err(LocalCommError::State(
                "can't stop while starting".into(),
            )),
        }
    }
}

/// Lifecycle notifications. Called synchronously; keep them short.
pub trait LocalStateListener: Send + Sync {
    fn on_started(&self) {}
    fn on_stopped(&self) {}
}

/// Per-connection notifications. Called synchronously from the client's
/// session; keep them short.
pub trait LocalClientListener: Send + Sync {
    fn on_local_connected(&self, _obj: &RemoteObject, _client: &LocalClient) {}
    fn on_local_connection_error(&self, _client: &LocalClient, _cause: &LocalCommError) {}
    fn on_local_disconnected(&self, _obj: &RemoteObject, _client: &LocalClient) {}
    fn on_local_message(&self, _obj: &RemoteObject, _client: &LocalClient, _line: &str) {}
}

#[derive(Default)]
struct Bookkeeping {
    available_services: Vec<DiscoveryService>,
    service_luids: HashMap<DiscoveryService, u32>,
    latches: HashMap<ClientId, oneshot::Sender<()>>,
    discovery_bindings: HashMap<ClientId, DiscoveryService>,
    /// Client plus its readiness flag (true once bound and active).
    connections: HashMap<ClientId, (LocalClient, bool)>,
    object_ids: HashMap<ClientId, String>,
    remote_objects: HashMap<ClientId, RemoteObject>,
    luids: HashMap<ClientId, u32>,
    backups: HashMap<String, Vec<LocalClient>>,
}

impl Bookkeeping {
    /// Drop a client from every per-client map; returns its bound object.
    fn forget(&mut self, id: ClientId) -> Option<RemoteObject> {
        self.latches.remove(&id);
        self.discovery_bindings.remove(&id);
        self.connections.remove(&id);
        self.object_ids.remove(&id);
        self.luids.remove(&id);
        self.remote_objects.remove(&id)
    }

    fn tracks(&self, id: ClientId) -> bool {
        self.discovery_bindings.contains_key(&id)
            || self.connections.contains_key(&id)
            || self.object_ids.contains_key(&id)
            || self.remote_objects.contains_key(&id)
            || self.luids.contains_key(&id)
    }

    fn active_for(&self, object_id: &str) -> Option<LocalClient> {
        self.connections
            .iter()
            .find(|(id, (client, ready))| {
                *ready
                    && self.object_ids.get(*id).map(String::as_str) == Some(object_id)
                    && client.state().is_connected()
            })
            .map(|(_, (client, _))| client.clone())
    }
}

enum Placement {
    Active,
    Backup,
    Gone,
}

/// Counts a running disconnect callback; leaving wakes `drain`.
struct InFlight<'a>(&'a ManagerShared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a ManagerShared) -> Self {
        shared.disconnects_in_flight.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.disconnects_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.books_changed.notify_waiters();
    }
}

struct ManagerShared {
    local_id: String,
    config: LocalConfig,
    tls: Option<Arc<TlsMaterial>>,
    tls_channel: Option<Arc<dyn SecureChannel>>,
    plain_channel: Arc<dyn SecureChannel>,
    local_cert_full: bool,
    validator: Arc<dyn IdentityValidator>,
    registry: Arc<dyn ObjectRegistry>,
    discover: Arc<dyn Discover>,
    state: Mutex<LocalState>,
    books: Mutex<Bookkeeping>,
    books_changed: Notify,
    /// Disconnect callbacks still running, including any backup promotion they started.
    disconnects_in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
    state_listeners: RwLock<Vec<Arc<dyn LocalStateListener>>>,
    client_listeners: RwLock<Vec<(ListenerId, Arc<dyn LocalClientListener>)>>,
    next_listener_id: AtomicU64,
    next_luid: AtomicU32,
}

/// Owner of all local clients of this service.
#[derive(Clone)]
pub struct LocalClientsManager {
    shared: Arc<ManagerShared>,
}

/// Non-owning handle held by clients and objects.
#[derive(Clone, Default)]
pub struct WeakManager(Weak<ManagerShared>);

impl WeakManager {
    pub fn upgrade(&self) -> Option<LocalClientsManager> {
        self.0.upgrade().map(|shared| LocalClientsManager { shared })
    }
}

pub struct ManagerBuilder {
    local_id: String,
    config: LocalConfig,
    tls: Option<Arc<TlsMaterial>>,
    registry: Option<Arc<dyn ObjectRegistry>>,
    discover: Option<Arc<dyn Discover>>,
    validator: Option<Arc<dyn IdentityValidator>>,
}

impl ManagerBuilder {
    pub fn tls(mut self, material: Arc<TlsMaterial>) -> Self {
        self.tls = Some(material);
        self
    }
    pub fn registry(mut self, registry: Arc<dyn ObjectRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
    pub fn discover(mut self, discover: Arc<dyn Discover>) -> Self {
        self.discover = Some(discover);
        self
    }
    pub fn validator(mut self, validator: Arc<dyn IdentityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn build(self) -> Result<LocalClientsManager> {
        self.config.validate()?;
        if self.config.only_ssl() && self.tls.is_none() {
            return Err(LocalCommError::Config(
                "'onlySSL' requires local certificate material".into(),
            ));
        }
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(DefaultIdentityValidator));
        let discover = match self.discover {
            Some(d) => d,
            None => discover_from_config(&self.config)?,
        };
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(InMemoryRegistry::default()));
        let tls_channel = self.tls.as_ref().map(|m| {
            Arc::new(TlsSecureChannel::new(
                m.clone(),
                self.config.ssl_sharing_enabled(),
                self.config.cert_sharing_timeout(),
            )) as Arc<dyn SecureChannel>
        });
        let local_cert_full = self
            .tls
            .as_ref()
            .map(|m| validator.is_full_service_id(m.certificate().id()))
            .unwrap_or(false);
        Ok(LocalClientsManager {
            shared: Arc::new(ManagerShared {
                local_id: self.local_id,
                config: self.config,
                tls: self.tls,
                tls_channel,
                plain_channel: Arc::new(PlaintextChannel::new()),
                local_cert_full,
                validator,
                registry,
                discover,
                state: Mutex::new(LocalState::Stop),
                books: Mutex::new(Bookkeeping::default()),
                books_changed: Notify::new(),
                disconnects_in_flight: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                discovery_task: Mutex::new(None),
                state_listeners: RwLock::new(Vec::new()),
                client_listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                next_luid: AtomicU32::new(1),
            }),
        })
    }
}

impl LocalClientsManager {
    /// `local_id` is this service's full id, sent to objects that can't read it
    /// from the certificate.
    pub fn builder(local_id: impl Into<String>, config: LocalConfig) -> ManagerBuilder {
        ManagerBuilder {
            local_id: local_id.into(),
            config,
            tls: None,
            registry: None,
            discover: None,
            validator: None,
        }
    }

    /// Manager wired from a full config file: keystore, trust policy and
    /// discovery backend included.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        cfg.local.validate()?;
        let mut builder = Self::builder(cfg.service.full_id.clone(), cfg.local.clone())
            .discover(discover_from_config(&cfg.local)?);
        if !cfg.local.only_no_ssl() {
            let cn = cfg.keystore.common_name(&cfg.service.full_id);
            let cert_path = cfg.keystore.cert_path();
            let key_path = cfg.keystore.key_path();
            let cert = LocalCertificate::load_or_generate(Path::new(&cert_path), Path::new(&key_path), &cn)?;
            emit_network_event(
                "local_clients",
                LogLevel::Info,
                "local_cert_ready",
                None,
                Some(format!(
                    "alias={} id={} fp={}",
                    cfg.keystore.alias(&cfg.service.full_id),
                    cert.id(),
                    cert.fingerprint()
                )),
            );
            let trust = Arc::new(TrustManager::new(EffectiveTrustPolicy::from_config(&cfg.trust)));
            builder = builder.tls(Arc::new(TlsMaterial::new(cert, trust)?));
        }
        builder.build()
    }

    pub fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.shared))
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }
    pub fn config(&self) -> &LocalConfig {
        &self.shared.config
    }
    pub fn tls_material(&self) -> Option<&Arc<TlsMaterial>> {
        self.shared.tls.as_ref()
    }
    pub fn state(&self) -> LocalState {
        *self.shared.state.lock()
    }
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn add_state_listener(&self, listener: Arc<dyn LocalStateListener>) {
        self.shared.state_listeners.write().push(listener);
    }

    pub fn add_client_listener(&self, listener: Arc<dyn LocalClientListener>) -> ListenerId {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared.client_listeners.write().push((id, listener));
        id
    }

    pub fn remove_client_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.client_listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    // ---- Accessors ----

    /// Every tracked client, connected or mid-handshake.
    pub fn local_clients(&self) -> Vec<LocalClient> {
        let books = self.shared.books.lock();
        let mut all: Vec<LocalClient> = books.connections.values().map(|(c, _)| c.clone()).collect();
        all.sort_by_key(|c| c.id());
        all
    }

    pub fn connected_clients(&self) -> Vec<LocalClient> {
        self.local_clients()
            .into_iter()
            .filter(|c| c.state().is_connected())
            .collect()
    }

    pub fn available_services(&self) -> Vec<DiscoveryService> {
        self.shared.books.lock().available_services.clone()
    }

    pub fn active_client_for(&self, object_id: &str) -> Option<LocalClient> {
        self.shared.books.lock().active_for(object_id)
    }

    pub fn backup_clients_for(&self, object_id: &str) -> Vec<LocalClient> {
        self.shared
            .books
            .lock()
            .backups
            .get(object_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remote_object_for(&self, client: &LocalClient) -> Option<RemoteObject> {
        self.shared.books.lock().remote_objects.get(&client.id()).cloned()
    }

    pub fn discovery_service_for(&self, client: &LocalClient) -> Option<DiscoveryService> {
        self.shared
            .books
            .lock()
            .discovery_bindings
            .get(&client.id())
            .cloned()
    }

    /// Whether any bookkeeping map still references `client`.
    pub fn tracks(&self, client: &LocalClient) -> bool {
        self.shared.books.lock().tracks(client.id())
    }

    // ---- Lifecycle ----

    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if !state.plan_start()? {
                return Ok(());
            }
            *state = LocalState::Starting;
        }
        self.shared.shutting_down.store(false, Ordering::SeqCst);
        self.log_system(LogLevel::Info, "local_starting", None);

        let rx = match self.shared.discover.start().await {
            Ok(rx) => rx,
            Err(e) => {
                *self.shared.state.lock() = LocalState::Stop;
                self.log_system(LogLevel::Error, "local_start_failed", Some(e.to_string()));
                return Err(e);
            }
        };
        let task = tokio::spawn(run_discovery(self.downgrade(), rx));
        *self.shared.discovery_task.lock() = Some(task);
        *self.shared.state.lock() = LocalState::RunWaiting;
        self.log_system(LogLevel::Info, "local_started", None);

        let listeners = self.shared.state_listeners.read().clone();
        for l in listeners {
            l.on_started();
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if !state.plan_stop()? {
                return Ok(());
            }
            *state = LocalState::ShuttingDown;
        }
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.log_system(LogLevel::Info, "local_stopping", None);

        if let Err(e) = self.shared.discover.stop().await {
            self.log_system(LogLevel::Warn, "discovery_stop_failed", Some(e.to_string()));
        }
        // The discovery channel is closed now; let the current attempt finish.
        let task = self.shared.discovery_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        if !self.drain(SHUTDOWN_DRAIN_TIMEOUT).await {
            self.log_system(
                LogLevel::Warn,
                "local_stop_drain_timeout",
                Some(format!("{} client(s) still tracked", self.local_clients().len())),
            );
        }
        {
            let mut books = self.shared.books.lock();
            books.available_services.clear();
            books.service_luids.clear();
            books.backups.clear();
        }

        *self.shared.state.lock() = LocalState::Stop;
        self.log_system(LogLevel::Info, "local_stopped", None);
        let listeners = self.shared.state_listeners.read().clone();
        for l in listeners {
            l.on_stopped();
        }
        Ok(())
    }

    /// Disconnect every tracked client until none is left or `wait` runs out.
    /// Clients promoted while draining are picked up on the next pass.
    async fn drain(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let changed = self.shared.books_changed.notified();
            let clients = self.local_clients();
            if clients.is_empty() && self.shared.disconnects_in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            for client in clients.iter().filter(|c| c.state().is_connected()) {
                if let Err(e) = client.disconnect().await {
                    self.log_client(LogLevel::Warn, "disconnect_failed", client, Some(e.to_string()));
                }
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return false;
            }
        }
    }

    // ---- Discovery ----

    async fn on_service_discovered(&self, service: DiscoveryService) {
        let dluid = {
            let mut books = self.shared.books.lock();
            if books.available_services.contains(&service) {
                drop(books);
                emit_discovery_event(LogLevel::Debug, "service_duplicate", None, service.to_string(), None);
                return;
            }
            let dluid = self.shared.next_luid.fetch_add(1, Ordering::Relaxed);
            books.available_services.push(service.clone());
            books.service_luids.insert(service.clone(), dluid);
            dluid
        };
        emit_discovery_event(
            LogLevel::Info,
            "service_discovered",
            Some(dluid),
            service.to_string(),
            Some(discovery_tag(dluid)),
        );

        if self.shared.config.only_localhost() && !service.is_loopback() {
            emit_discovery_event(
                LogLevel::Debug,
                "service_skipped",
                Some(dluid),
                service.to_string(),
                Some("not a localhost address".into()),
            );
            return;
        }

        if !self.shared.config.only_no_ssl() {
            match self.shared.tls_channel.clone() {
                Some(channel) => {
                    if self.establish(&service, TransportKind::Tls, channel, dluid).await {
                        return;
                    }
                }
                None => emit_discovery_event(
                    LogLevel::Debug,
                    "tls_unavailable",
                    Some(dluid),
                    service.to_string(),
                    Some("no local certificate material".into()),
                ),
            }
        }
        if !self.shared.config.only_ssl() {
            let channel = self.shared.plain_channel.clone();
            if self.establish(&service, TransportKind::Plain, channel, dluid).await {
                return;
            }
        }
        emit_discovery_event(
            LogLevel::Warn,
            "service_unreachable",
            Some(dluid),
            service.to_string(),
            Some("no transport could connect".into()),
        );
    }

    fn on_service_lost(&self, service: DiscoveryService) {
        let dluid = {
            let mut books = self.shared.books.lock();
            books.available_services.retain(|s| s != &service);
            // A withdrawn endpoint is no failover candidate anymore.
            for list in books.backups.values_mut() {
                list.retain(|b| b.service() != &service);
            }
            books.backups.retain(|_, list| !list.is_empty());
            books.service_luids.remove(&service)
        };
        emit_discovery_event(LogLevel::Info, "service_lost", dluid, service.to_string(), None);
    }

    /// One connection attempt over `kind`. True when the client reached CONNECTED.
    async fn establish(
        &self,
        service: &DiscoveryService,
        kind: TransportKind,
        channel: Arc<dyn SecureChannel>,
        dluid: u32,
    ) -> bool {
        let client = self.new_client(service.clone(), kind, channel);
        let (tx, rx) = oneshot::channel();
        {
            let mut books = self.shared.books.lock();
            books.discovery_bindings.insert(client.id(), service.clone());
            books.latches.insert(client.id(), tx);
        }
        emit_discovery_event(
            LogLevel::Debug,
            "connect_attempt",
            Some(dluid),
            service.to_string(),
            Some(format!("{:?} client={}", kind, client.id())),
        );

        match client.connect().await {
            Ok(()) => {
                if tokio::time::timeout(self.shared.config.connect_wait_timeout(), rx)
                    .await
                    .is_err()
                {
                    emit_discovery_event(
                        LogLevel::Warn,
                        "connect_wait_timeout",
                        Some(dluid),
                        service.to_string(),
                        Some(format!("{:?} client={}", kind, client.id())),
                    );
                }
            }
            Err(e) => emit_discovery_event(
                LogLevel::Debug,
                "connect_attempt_failed",
                Some(dluid),
                service.to_string(),
                Some(format!("{:?}: {}", kind, e)),
            ),
        }
        self.shared.books.lock().latches.remove(&client.id());

        if client.state().is_connected() {
            return true;
        }
        self.shared.books.lock().discovery_bindings.remove(&client.id());
        false
    }

    fn new_client(
        &self,
        service: DiscoveryService,
        kind: TransportKind,
        channel: Arc<dyn SecureChannel>,
    ) -> LocalClient {
        LocalClient::new(
            self.downgrade(),
            kind,
            service,
            &self.shared.local_id,
            channel,
            self.shared.config.connect_timeout(),
            kind == TransportKind::Tls && self.shared.local_cert_full,
        )
    }

    // ---- Client callbacks ----

    pub(crate) async fn on_client_connected(&self, client: &LocalClient) {
        let id = client.id();
        let luid = self.shared.next_luid.fetch_add(1, Ordering::Relaxed);
        client.set_luid(luid);
        {
            let mut books = self.shared.books.lock();
            if let Some(latch) = books.latches.remove(&id) {
                let _ = latch.send(());
            }
            if !books.discovery_bindings.contains_key(&id) {
                self.log_client(LogLevel::Warn, "missing_discovery_binding", client, None);
            }
            books.connections.insert(id, (client.clone(), false));
            books.luids.insert(id, luid);
        }
        self.shared.books_changed.notify_waiters();

        if let Some(cert_id) = client.peer().auth().and_then(|a| a.remote_cert_id().map(str::to_owned)) {
            client.peer().set_remote_id(cert_id);
        }
        client.update_security(self.shared.validator.as_ref());
        self.log_client(
            LogLevel::Info,
            "client_connected",
            client,
            Some(format!("{} {:?}", client_tag(luid), client.security_level())),
        );

        let object_id = match self.resolve_object_id(client).await {
            Ok(oid) => oid,
            Err(e) => {
                // Nothing was bound yet; bookkeeping goes, no listener event.
                self.log_client(LogLevel::Warn, "identity_failed", client, Some(e.to_string()));
                self.shared.books.lock().forget(id);
                self.shared.books_changed.notify_waiters();
                client.settle(ClientPhase::Abandoned);
                let _ = client.disconnect().await;
                return;
            }
        };
        self.shared
            .books
            .lock()
            .object_ids
            .insert(id, object_id.clone());

        let obj = match self
            .shared
            .registry
            .create_new_remote_object(client, &object_id)
            .await
        {
            Ok(obj) => obj,
            Err(e) => return self.discard(client, e).await,
        };

        if !client.is_ssl() || !client.is_local_cert_full() {
            if let Err(e) = client.send_line(&self.shared.local_id).await {
                return self.discard(client, e).await;
            }
        }

        if let Err(e) = client.set_remote_object(obj.clone()) {
            return self.discard(client, e).await;
        }

        let placement = {
            let mut books = self.shared.books.lock();
            if !books.connections.contains_key(&id) {
                Placement::Gone
            } else if let Some(active) = books.active_for(&object_id) {
                if active.id() != id {
                    books.forget(id);
                    books
                        .backups
                        .entry(object_id.clone())
                        .or_default()
                        .push(client.clone());
                    Placement::Backup
                } else {
                    Placement::Active
                }
            } else {
                books.connections.insert(id, (client.clone(), true));
                books.remote_objects.insert(id, obj.clone());
                Placement::Active
            }
        };
        self.shared.books_changed.notify_waiters();

        match placement {
            Placement::Active => {
                client.settle(ClientPhase::Bound);
                if client.is_promoted() {
                    self.log_client(LogLevel::Info, "client_switched", client, Some(format!("object={}", object_id)));
                } else {
                    self.log_client(LogLevel::Info, "client_bound", client, Some(format!("object={}", object_id)));
                    self.fire(|l| l.on_local_connected(&obj, client));
                }
            }
            Placement::Backup => {
                client.mark_demoted();
                client.settle(ClientPhase::Backup);
                self.log_client(LogLevel::Info, "client_backup", client, Some(format!("object={}", object_id)));
                let _ = client.disconnect().await;
            }
            Placement::Gone => client.settle(ClientPhase::Abandoned),
        }
    }

    /// Full object id of the remote: from its certificate when that is
    /// already full, otherwise from the identity line it sends.
    async fn resolve_object_id(&self, client: &LocalClient) -> Result<String> {
        let validator = self.shared.validator.as_ref();
        if client.is_ssl() {
            let cert_id = client
                .peer()
                .auth()
                .and_then(|a| a.remote_cert_id().map(str::to_owned));
            if let Some(id) = cert_id.filter(|id| validator.is_full_object_id(id)) {
                return Ok(id);
            }
        }
        let line = client
            .read_line(self.shared.config.identity_read_timeout())
            .await?;
        if !validator.is_full_object_id(&line) {
            return Err(LocalCommError::Identity(format!(
                "'{}' is not a full object id",
                line
            )));
        }
        client.peer().set_remote_id(line.clone());
        Ok(line)
    }

    async fn discard(&self, client: &LocalClient, cause: LocalCommError) {
        self.shared.books.lock().forget(client.id());
        self.shared.books_changed.notify_waiters();
        client.settle(ClientPhase::Abandoned);
        self.log_client(LogLevel::Warn, "client_discarded", client, Some(cause.to_string()));
        let _ = client.disconnect().await;
        self.fire(|l| l.on_local_connection_error(client, &cause));
    }

    pub(crate) async fn on_client_disconnected(&self, client: &LocalClient) {
        let _in_flight = InFlight::enter(&self.shared);
        let (tracked, removed) = {
            let mut books = self.shared.books.lock();
            let tracked = books.tracks(client.id());
            (tracked, books.forget(client.id()))
        };
        self.shared.books_changed.notify_waiters();
        client.settle(ClientPhase::Abandoned);

        if client.is_backup() {
            self.log_client(LogLevel::Debug, "backup_parked", client, None);
            return;
        }
        if !tracked {
            // Already failed or discarded and logged as such.
            self.log_client(LogLevel::Debug, "client_closed", client, None);
            return;
        }
        self.log_client(LogLevel::Info, "client_disconnected", client, None);
        let Some(obj) = removed else {
            return;
        };

        let suppress = self.shared.shutting_down.load(Ordering::SeqCst)
            && self.shared.config.suppress_failover_on_shutdown();
        if !suppress && self.active_client_for(obj.id()).is_none() {
            self.promote_backup(&obj).await;
        }
        if let Some(active) = self.active_client_for(obj.id()) {
            self.log_client(
                LogLevel::Info,
                "object_switched",
                &active,
                Some(format!("object={} from client={}", obj.id(), client.id())),
            );
        } else {
            self.fire(|l| l.on_local_disconnected(&obj, client));
        }
    }

    /// Reconnect parked backups of `obj`, oldest first, until one binds.
    async fn promote_backup(&self, obj: &RemoteObject) -> bool {
        let mut failed = Vec::new();
        let promoted = loop {
            let next = {
                let mut books = self.shared.books.lock();
                match books.backups.get_mut(obj.id()) {
                    Some(list) if !list.is_empty() => {
                        let next = list.remove(0);
                        if list.is_empty() {
                            books.backups.remove(obj.id());
                        }
                        Some(next)
                    }
                    _ => None,
                }
            };
            let Some(backup) = next else {
                break false;
            };
            if self.try_backup(obj, &backup).await {
                break true;
            }
            failed.push(backup);
        };
        // Endpoints that failed now stay candidates for the next failover.
        if !failed.is_empty() {
            self.shared
                .books
                .lock()
                .backups
                .entry(obj.id().to_string())
                .or_default()
                .extend(failed);
        }
        promoted
    }

    async fn try_backup(&self, obj: &RemoteObject, backup: &LocalClient) -> bool {
        let fresh = backup.respawn();
        fresh.mark_promoted();
        self.shared
            .books
            .lock()
            .discovery_bindings
            .insert(fresh.id(), backup.service().clone());
        self.log_client(
            LogLevel::Info,
            "backup_promoting",
            &fresh,
            Some(format!("object={} service={}", obj.id(), backup.service())),
        );

        if let Err(e) = fresh.connect().await {
            self.log_client(LogLevel::Warn, "backup_promotion_failed", &fresh, Some(e.to_string()));
            self.shared.books.lock().discovery_bindings.remove(&fresh.id());
            return false;
        }
        match fresh.wait_settled(self.shared.config.connect_wait_timeout()).await {
            ClientPhase::Bound => true,
            phase => {
                self.log_client(
                    LogLevel::Warn,
                    "backup_promotion_failed",
                    &fresh,
                    Some(format!("settled as {:?}", phase)),
                );
                if phase == ClientPhase::Pending {
                    let _ = fresh.disconnect().await;
                }
                false
            }
        }
    }

    pub(crate) fn on_client_failed(&self, client: &LocalClient, msg: &str, cause: &LocalCommError) {
        {
            let mut books = self.shared.books.lock();
            if let Some(latch) = books.latches.remove(&client.id()) {
                let _ = latch.send(());
            }
            books.forget(client.id());
        }
        self.shared.books_changed.notify_waiters();
        client.settle(ClientPhase::Abandoned);
        self.log_client(LogLevel::Warn, "client_failed", client, Some(format!("{}: {}", msg, cause)));
        self.fire(|l| l.on_local_connection_error(client, cause));
    }

    pub(crate) fn on_client_data(&self, client: &LocalClient, line: &str) {
        let obj = self.shared.books.lock().remote_objects.get(&client.id()).cloned();
        match obj {
            Some(obj) => self.fire(|l| l.on_local_message(&obj, client, line)),
            None => self.log_client(LogLevel::Debug, "unbound_data_dropped", client, None),
        }
    }

    fn fire(&self, f: impl Fn(&dyn LocalClientListener)) {
        let listeners: Vec<Arc<dyn LocalClientListener>> = self
            .shared
            .client_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for l in listeners {
            f(l.as_ref());
        }
    }

    fn log_client(&self, level: LogLevel, action: &str, client: &LocalClient, detail: Option<String>) {
        let remote = client.remote_id();
        emit_connection_event(
            "local_clients",
            level,
            action,
            ConnectionTag {
                luid: client.luid(),
                local_id: client.local_id(),
                remote_id: &remote,
                state: client.state().to_string(),
                reason: client.disconnection_reason().to_string(),
            },
            detail,
        );
    }

    fn log_system(&self, level: LogLevel, action: &str, detail: Option<String>) {
        let meta = dispatcher::meta("local_clients", level);
        dispatcher::emit(LogEvent::System(SystemEvent {
            meta,
            action: action.to_string(),
            detail,
        }));
    }
}

async fn run_discovery(manager: WeakManager, mut rx: mpsc::UnboundedReceiver<DiscoveryEvent>) {
    while let Some(evt) = rx.recv().await {
        let Some(mgr) = manager.upgrade() else {
            break;
        };
        if mgr.state() == LocalState::ShuttingDown {
            break;
        }
        match evt {
            DiscoveryEvent::Discovered(service) => mgr.on_service_discovered(service).await,
            DiscoveryEvent::Lost(service) => mgr.on_service_lost(service),
        }
    }
}
