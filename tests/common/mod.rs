// Shared helpers for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use localcomm::config::LocalConfig;
use localcomm::network::{
    DisconnectionReason, LocalClient, LocalClientListener, LocalClientsManager, ManualDiscover,
    Peer, PeerConnectionListener,
};
use localcomm::objs::RemoteObject;
use localcomm::LocalCommError;

pub const SERVICE_ID: &str = "srvId/usrId/instId";
pub const OBJECT_ID: &str = "11111-22222-33333";

/// Poll `cond` until it holds or `wait` elapses.
pub async fn wait_until(wait: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Records manager notifications as short strings.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl LocalClientListener for Recorder {
    fn on_local_connected(&self, obj: &RemoteObject, _client: &LocalClient) {
        self.events.lock().push(format!("connected:{}", obj.id()));
    }
    fn on_local_connection_error(&self, _client: &LocalClient, cause: &LocalCommError) {
        self.events.lock().push(format!("error:{}", cause.kind()));
    }
    fn on_local_disconnected(&self, obj: &RemoteObject, _client: &LocalClient) {
        self.events.lock().push(format!("disconnected:{}", obj.id()));
    }
    fn on_local_message(&self, obj: &RemoteObject, _client: &LocalClient, line: &str) {
        self.events.lock().push(format!("message:{}:{}", obj.id(), line));
    }
}

/// Captures what the object side sees of its peers.
#[derive(Default)]
pub struct PeerLog {
    pub lines: Mutex<Vec<String>>,
    pub reasons: Mutex<Vec<DisconnectionReason>>,
}

#[async_trait]
impl PeerConnectionListener for PeerLog {
    async fn on_disconnect(&self, peer: &Peer) {
        self.reasons.lock().push(peer.disconnection_reason());
    }
    async fn on_data(&self, _peer: &Peer, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Plaintext-only settings with short timeouts.
pub fn plain_config() -> LocalConfig {
    LocalConfig {
        only_no_ssl: Some(true),
        connect_timeout_ms: Some(2_000),
        identity_read_timeout_ms: Some(2_000),
        connect_wait_timeout_ms: Some(5_000),
        ..Default::default()
    }
}

pub fn plain_manager(discover: &ManualDiscover) -> (LocalClientsManager, Arc<Recorder>) {
    let manager = LocalClientsManager::builder(SERVICE_ID, plain_config())
        .discover(Arc::new(discover.clone()))
        .build()
        .expect("manager");
    let recorder = Arc::new(Recorder::default());
    manager.add_client_listener(recorder.clone());
    (manager, recorder)
}
