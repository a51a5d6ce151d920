// src/network/peer.rs
//
// One end of a line-oriented connection plus its state machine. Every state
// change is queued on a per-peer channel and delivered to the listeners by a
// single session task, so callbacks for one peer run in transition order and
// never overlap.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{LocalCommError, Result};
use crate::events::model::LogLevel;
use crate::network::events::{emit_connection_event, ConnectionTag};
use crate::network::state::{ConnectionState, DisconnectionReason};
use crate::security::secure_channel::{AuthSummary, BoxedReader, BoxedWriter, Channel, SecureChannel};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Dialed out by this process.
    Client,
    /// Accepted by a listener.
    Server,
}

/// Callbacks for one peer. All methods default to no-ops.
#[async_trait]
pub trait PeerConnectionListener: Send + Sync {
    async fn on_connecting(&self, _peer: &Peer) {}
    async fn on_waiting(&self, _peer: &Peer) {}
    async fn on_connect(&self, _peer: &Peer) {}
    async fn on_disconnecting(&self, _peer: &Peer) {}
    async fn on_disconnect(&self, _peer: &Peer) {}
    async fn on_fail(&self, _peer: &Peer, _msg: &str, _cause: &LocalCommError) {}
    /// A line received after the connection was reported.
    async fn on_data(&self, _peer: &Peer, _line: &str) {}
}

enum PeerEvent {
    State(ConnectionState),
    Fail(String, Arc<LocalCommError>),
    Data(String),
    ReadClosed(Option<String>),
}

struct Status {
    state: ConnectionState,
    reason: DisconnectionReason,
    /// Never connected; the only case where `connect()` is allowed.
    fresh: bool,
}

struct PeerInner {
    id: u64,
    role: PeerRole,
    local_id: String,
    remote_id: RwLock<String>,
    remote_addr: SocketAddr,
    local_addr: RwLock<Option<SocketAddr>>,
    secure: Option<Arc<dyn SecureChannel>>,
    connect_timeout: Duration,
    status: Mutex<Status>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    listeners: RwLock<Vec<Arc<dyn PeerConnectionListener>>>,
    reader: tokio::sync::Mutex<Option<BoxedReader>>,
    pending: Mutex<Option<String>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    auth: RwLock<Option<AuthSummary>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("remote_id", &*self.inner.remote_id.read())
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Peer {}

impl Peer {
    fn build(
        role: PeerRole,
        local_id: String,
        remote_id: String,
        remote_addr: SocketAddr,
        secure: Option<Arc<dyn SecureChannel>>,
        connect_timeout: Duration,
        status: Status,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(PeerInner {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                role,
                local_id,
                remote_id: RwLock::new(remote_id),
                remote_addr,
                local_addr: RwLock::new(None),
                secure,
                connect_timeout,
                status: Mutex::new(status),
                events_tx: tx,
                events_rx: Mutex::new(Some(rx)),
                listeners: RwLock::new(Vec::new()),
                reader: tokio::sync::Mutex::new(None),
                pending: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                auth: RwLock::new(None),
                reader_task: Mutex::new(None),
            }),
        }
    }

    /// A peer that will dial `remote_addr` over `secure` when `connect()` is called.
    pub fn client(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        remote_addr: SocketAddr,
        secure: Arc<dyn SecureChannel>,
        connect_timeout: Duration,
    ) -> Self {
        Self::build(
            PeerRole::Client,
            local_id.into(),
            remote_id.into(),
            remote_addr,
            Some(secure),
            connect_timeout,
            Status {
                state: ConnectionState::Disconnected,
                reason: DisconnectionReason::NotDisconnected,
                fresh: true,
            },
        )
    }

    /// A peer for an already negotiated inbound channel. It starts `Connected`;
    /// the connect callback fires once `activate()` is called.
    pub fn accepted(
        local_id: impl Into<String>,
        remote_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        channel: Channel,
    ) -> Self {
        let peer = Self::build(
            PeerRole::Server,
            local_id.into(),
            remote_addr.to_string(),
            remote_addr,
            None,
            Duration::ZERO,
            Status {
                state: ConnectionState::Connected,
                reason: DisconnectionReason::NotDisconnected,
                fresh: false,
            },
        );
        *peer.inner.local_addr.write() = local_addr;
        peer.install_channel(channel);
        let _ = peer
            .inner
            .events_tx
            .send(PeerEvent::State(ConnectionState::Connected));
        peer
    }

    /// Start delivering queued events to listeners.
    pub fn activate(&self) {
        let rx = self.inner.events_rx.lock().take();
        if let Some(rx) = rx {
            tokio::spawn(run_session(self.clone(), rx));
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PeerConnectionListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }
    pub fn role(&self) -> PeerRole {
        self.inner.role
    }
    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }
    pub fn remote_id(&self) -> String {
        self.inner.remote_id.read().clone()
    }
    pub fn set_remote_id(&self, id: impl Into<String>) {
        *self.inner.remote_id.write() = id.into();
    }
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }
    pub fn state(&self) -> ConnectionState {
        self.inner.status.lock().state
    }
    pub fn disconnection_reason(&self) -> DisconnectionReason {
        self.inner.status.lock().reason
    }
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
    pub fn auth(&self) -> Option<AuthSummary> {
        self.inner.auth.read().clone()
    }

    fn install_channel(&self, channel: Channel) {
        *self.inner.auth.write() = Some(channel.auth);
        *self.inner.pending.lock() = channel.pending;
        // Fresh locks; nothing else can hold them yet.
        if let Ok(mut r) = self.inner.reader.try_lock() {
            *r = Some(channel.reader);
        }
        if let Ok(mut w) = self.inner.writer.try_lock() {
            *w = Some(channel.writer);
        }
    }

    fn log_state(&self, state: ConnectionState, reason: DisconnectionReason) {
        let remote = self.remote_id();
        emit_connection_event(
            "peer",
            LogLevel::Debug,
            "state_changed",
            ConnectionTag {
                luid: None,
                local_id: &self.inner.local_id,
                remote_id: &remote,
                state: state.to_string(),
                reason: reason.to_string(),
            },
            Some(format!("peer={} addr={}", self.inner.id, self.inner.remote_addr)),
        );
    }

    /// Move forward to `next`. Terminal transitions record `reason` unless one is set.
    fn transition(&self, next: ConnectionState, reason: DisconnectionReason) -> bool {
        let (state, reason) = {
            let mut st = self.inner.status.lock();
            if st.state.is_disconnected() || !st.state.can_advance_to(next) {
                return false;
            }
            st.state = next;
            if next.is_disconnected() && st.reason == DisconnectionReason::NotDisconnected {
                st.reason = reason;
            }
            let _ = self.inner.events_tx.send(PeerEvent::State(next));
            (st.state, st.reason)
        };
        self.log_state(state, reason);
        true
    }

    fn fail(&self, msg: &str, cause: LocalCommError) -> LocalCommError {
        let cause = Arc::new(cause);
        let moved = {
            let mut st = self.inner.status.lock();
            if st.state.is_disconnected() {
                false
            } else {
                st.state = ConnectionState::Disconnected;
                if st.reason == DisconnectionReason::NotDisconnected {
                    st.reason = DisconnectionReason::ConnectFailed;
                }
                let _ = self
                    .inner
                    .events_tx
                    .send(PeerEvent::Fail(msg.to_string(), cause.clone()));
                let _ = self
                    .inner
                    .events_tx
                    .send(PeerEvent::State(ConnectionState::Disconnected));
                true
            }
        };
        if moved {
            self.log_state(ConnectionState::Disconnected, self.disconnection_reason());
        }
        LocalCommError::Connection(format!("{}: {}", msg, cause))
    }

    /// Dial, negotiate the secure channel and report `Connected`.
    ///
    /// Only a never-connected client peer can connect; a disconnected peer stays disconnected.
    pub async fn connect(&self) -> Result<()> {
        let secure = match &self.inner.secure {
            Some(s) => s.clone(),
            None => {
                return Err(LocalCommError::State(
                    "accepted peers cannot connect".into(),
                ))
            }
        };
        {
            let mut st = self.inner.status.lock();
            if !st.fresh {
                return Err(LocalCommError::State(format!(
                    "peer {} already used (state {})",
                    self.inner.id, st.state
                )));
            }
            st.fresh = false;
            st.state = ConnectionState::Connecting;
            let _ = self
                .inner
                .events_tx
                .send(PeerEvent::State(ConnectionState::Connecting));
        }
        self.log_state(ConnectionState::Connecting, DisconnectionReason::NotDisconnected);
        self.activate();

        let addr = self.inner.remote_addr;
        let stream = match tokio::time::timeout(self.inner.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(self.fail("tcp connect failed", e.into())),
            Err(_) => {
                return Err(self.fail(
                    "tcp connect timed out",
                    LocalCommError::Connection(addr.to_string()),
                ))
            }
        };
        *self.inner.local_addr.write() = stream.local_addr().ok();

        if !self.transition(ConnectionState::WaitingServer, DisconnectionReason::LocalRequest) {
            return Err(LocalCommError::Connection("connect aborted".into()));
        }
        // The sharing wait has its own bound; do not let the handshake budget cut it short.
        let negotiation = self.inner.connect_timeout + secure.negotiation_allowance();
        let channel = match tokio::time::timeout(negotiation, secure.connect(stream, addr)).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => return Err(self.fail("secure channel negotiation failed", e.into())),
            Err(_) => {
                return Err(self.fail(
                    "secure channel negotiation timed out",
                    LocalCommError::Connection(addr.to_string()),
                ))
            }
        };
        *self.inner.auth.write() = Some(channel.auth);
        *self.inner.pending.lock() = channel.pending;
        *self.inner.reader.lock().await = Some(channel.reader);
        *self.inner.writer.lock().await = Some(channel.writer);

        if !self.transition(ConnectionState::Connected, DisconnectionReason::LocalRequest) {
            self.close_io().await;
            return Err(LocalCommError::Connection("connect aborted".into()));
        }
        Ok(())
    }

    /// Close the connection. Idempotent; the reason becomes `LocalRequest`
    /// unless the remote side closed first.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut st = self.inner.status.lock();
            if st.state.is_disconnected() || st.state.is_disconnecting() {
                return Ok(());
            }
            st.state = ConnectionState::Disconnecting;
            let _ = self
                .inner
                .events_tx
                .send(PeerEvent::State(ConnectionState::Disconnecting));
        }
        self.log_state(ConnectionState::Disconnecting, DisconnectionReason::NotDisconnected);
        self.close_io().await;
        self.transition(ConnectionState::Disconnected, DisconnectionReason::LocalRequest);
        Ok(())
    }

    async fn close_io(&self) {
        let task = self.inner.reader_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut w) = writer {
            let _ = w.shutdown().await;
        }
        self.inner.reader.lock().await.take();
    }

    async fn closed_by_remote(&self, error: Option<String>) {
        {
            let st = self.inner.status.lock();
            if st.state.is_disconnected() || st.state.is_disconnecting() {
                return;
            }
        }
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut w) = writer {
            let _ = w.shutdown().await;
        }
        let reason = match error {
            Some(_) => DisconnectionReason::StreamError,
            None => DisconnectionReason::RemoteRequest,
        };
        self.transition(ConnectionState::Disconnected, reason);
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(LocalCommError::NotConnected);
        }
        let mut guard = self.inner.writer.lock().await;
        let w = guard.as_mut().ok_or(LocalCommError::NotConnected)?;
        w.write_all(data).await?;
        w.flush().await?;
        Ok(())
    }

    /// Send `line` followed by `\n`.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.send(buf.as_bytes()).await
    }

    /// Read one line directly from the connection, before the background
    /// reader takes over (i.e. from inside `on_connect`).
    pub async fn read_line(&self, wait: Duration) -> Result<String> {
        if let Some(line) = self.inner.pending.lock().take() {
            return Ok(line);
        }
        let mut guard = self.inner.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| LocalCommError::Connection("reader no longer available".into()))?;
        let mut line = String::new();
        match tokio::time::timeout(wait, reader.read_line(&mut line)).await {
            Err(_) => Err(LocalCommError::Identity(format!(
                "no line within {}ms",
                wait.as_millis()
            ))),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) => Err(LocalCommError::Connection("connection closed".into())),
            Ok(Ok(_)) => Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string()),
        }
    }

    async fn start_reader(&self) {
        if !self.is_connected() {
            return;
        }
        let Some(mut reader) = self.inner.reader.lock().await.take() else {
            return;
        };
        let pending = self.inner.pending.lock().take();
        let tx = self.inner.events_tx.clone();
        let task = tokio::spawn(async move {
            if let Some(line) = pending {
                let _ = tx.send(PeerEvent::Data(line));
            }
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        let _ = tx.send(PeerEvent::ReadClosed(None));
                        break;
                    }
                    Ok(_) => {
                        let _ = tx.send(PeerEvent::Data(
                            line.trim_end_matches(&['\r', '\n'][..]).to_string(),
                        ));
                    }
                    Err(e) => {
                        let _ = tx.send(PeerEvent::ReadClosed(Some(e.to_string())));
                        break;
                    }
                }
            }
        });
        *self.inner.reader_task.lock() = Some(task);
    }
}

async fn run_session(peer: Peer, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(evt) = rx.recv().await {
        let listeners = peer.inner.listeners.read().clone();
        match evt {
            PeerEvent::State(state) => {
                for l in &listeners {
                    match state {
                        ConnectionState::Connecting => l.on_connecting(&peer).await,
                        ConnectionState::WaitingServer => l.on_waiting(&peer).await,
                        ConnectionState::Connected => l.on_connect(&peer).await,
                        ConnectionState::Disconnecting => l.on_disconnecting(&peer).await,
                        ConnectionState::Disconnected => l.on_disconnect(&peer).await,
                    }
                }
                match state {
                    ConnectionState::Connected => peer.start_reader().await,
                    ConnectionState::Disconnected => break,
                    _ => {}
                }
            }
            PeerEvent::Fail(msg, cause) => {
                for l in &listeners {
                    l.on_fail(&peer, &msg, &cause).await;
                }
            }
            PeerEvent::Data(line) => {
                for l in &listeners {
                    l.on_data(&peer, &line).await;
                }
            }
            PeerEvent::ReadClosed(err) => peer.closed_by_remote(err).await,
        }
    }
}
