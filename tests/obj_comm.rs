use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use localcomm::network::{
    LocalClient, LocalClientsManager, LocalObjectServer, ManualDiscover, ObjectServerConfig,
};
use localcomm::objs::{
    CloudConnection, NoCloud, ObjectRegistry, RemoteObject, RemoteObjectListener,
};
use localcomm::{LocalCommError, Result};

mod common;
use common::{plain_config, wait_until, PeerLog, OBJECT_ID, SERVICE_ID};

#[derive(Default)]
struct ObjLog {
    events: Mutex<Vec<String>>,
}

impl RemoteObjectListener for ObjLog {
    fn on_local_connected(&self, obj: &RemoteObject, _client: &LocalClient) {
        self.events.lock().push(format!("local_up:{}", obj.id()));
    }
    fn on_local_disconnected(&self, obj: &RemoteObject, _client: &LocalClient) {
        self.events.lock().push(format!("local_down:{}", obj.id()));
    }
    fn on_local_message(&self, _obj: &RemoteObject, _client: &LocalClient, line: &str) {
        self.events.lock().push(format!("msg:{}", line));
    }
    fn on_cloud_connected(&self, _obj: &RemoteObject) {
        self.events.lock().push("cloud_up".into());
    }
    fn on_cloud_disconnected(&self, _obj: &RemoteObject) {
        self.events.lock().push("cloud_down".into());
    }
}

struct Cloud(AtomicBool);

impl CloudConnection for Cloud {
    fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn idle_manager() -> LocalClientsManager {
    LocalClientsManager::builder(SERVICE_ID, plain_config())
        .discover(Arc::new(ManualDiscover::new()))
        .build()
        .unwrap()
}

#[test]
fn cloud_flag_emits_on_change_only() {
    let manager = idle_manager();
    let cloud = Arc::new(Cloud(AtomicBool::new(true)));
    let obj = RemoteObject::new(OBJECT_ID, &manager, cloud.clone());
    let log = Arc::new(ObjLog::default());
    obj.comm().add_listener(log.clone());

    assert!(!obj.comm().is_cloud_connected());
    obj.comm().set_cloud_connected(true);
    obj.comm().set_cloud_connected(true);
    assert!(obj.comm().is_cloud_connected());
    assert!(obj.comm().is_connected());
    assert!(!obj.comm().is_local_connected());

    // Link down at the cloud side masks the flag.
    cloud.0.store(false, Ordering::SeqCst);
    assert!(!obj.comm().is_cloud_connected());

    obj.comm().set_cloud_connected(false);
    obj.comm().set_cloud_connected(false);
    assert_eq!(*log.events.lock(), vec!["cloud_up", "cloud_down"]);
}

#[tokio::test]
async fn send_local_without_connection_fails() {
    let manager = idle_manager();
    let obj = RemoteObject::new(OBJECT_ID, &manager, Arc::new(NoCloud));
    assert_eq!(obj.name(), OBJECT_ID);
    obj.set_name("Kitchen lamp");
    assert_eq!(obj.name(), "Kitchen lamp");
    assert!(obj.comm().active_local_client().is_none());
    assert!(obj.comm().local_backup_clients().is_empty());
    assert!(matches!(
        obj.comm().send_local("x").await,
        Err(LocalCommError::NotConnected)
    ));
}

/// Hands out one pre-built object so listeners can be attached before connecting.
struct Fixed(Mutex<Option<RemoteObject>>);

#[async_trait]
impl ObjectRegistry for Fixed {
    async fn create_new_remote_object(
        &self,
        _client: &LocalClient,
        remote_id: &str,
    ) -> Result<RemoteObject> {
        self.0
            .lock()
            .clone()
            .filter(|o| o.id() == remote_id)
            .ok_or_else(|| LocalCommError::Registry(remote_id.to_string()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn object_listeners_follow_local_connection() {
    let server_log = Arc::new(PeerLog::default());
    let server = LocalObjectServer::start(ObjectServerConfig::new(OBJECT_ID))
        .await
        .unwrap();
    server.add_peer_listener(server_log.clone());
    let discover = ManualDiscover::new();
    discover.publish(server.discovery_record("lamp"));

    let registry = Arc::new(Fixed(Mutex::new(None)));
    let manager = LocalClientsManager::builder(SERVICE_ID, plain_config())
        .discover(Arc::new(discover.clone()))
        .registry(registry.clone())
        .build()
        .unwrap();
    let obj = RemoteObject::new(OBJECT_ID, &manager, Arc::new(NoCloud));
    let other = RemoteObject::new("99999-88888-77777", &manager, Arc::new(NoCloud));
    *registry.0.lock() = Some(obj.clone());
    let log = Arc::new(ObjLog::default());
    let other_log = Arc::new(ObjLog::default());
    obj.comm().add_listener(log.clone());
    other.comm().add_listener(other_log.clone());

    manager.start().await.unwrap();
    let wait = Duration::from_secs(5);
    assert!(wait_until(wait, || obj.comm().is_local_connected()).await);
    assert!(wait_until(wait, || log.events.lock().contains(&format!("local_up:{}", OBJECT_ID))).await);

    assert!(wait_until(wait, || server.clients().len() == 1).await);
    obj.comm().send_local("brightness 40").await.unwrap();
    assert!(wait_until(wait, || server_log.lines.lock().contains(&"brightness 40".to_string())).await);
    server.broadcast("ack").await;
    assert!(wait_until(wait, || log.events.lock().contains(&"msg:ack".to_string())).await);

    manager.stop().await.unwrap();
    assert!(wait_until(wait, || log.events.lock().contains(&format!("local_down:{}", OBJECT_ID))).await);
    assert!(!obj.comm().is_local_connected());
    assert!(other_log.events.lock().is_empty());
    server.stop().await;
}
