// Manager against plaintext object servers on loopback.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use localcomm::network::{
    DisconnectionReason, DiscoveryService, LocalClient, LocalClientsManager, LocalObjectServer,
    ManualDiscover, ObjectServerConfig, SecurityLevel, TransportKind,
};
use localcomm::objs::{ObjectRegistry, RemoteObject};
use localcomm::{LocalCommError, Result};

mod common;
use common::{plain_config, plain_manager, wait_until, PeerLog, Recorder, OBJECT_ID, SERVICE_ID};

const WAIT: Duration = Duration::from_secs(5);

async fn object_server(log: Option<Arc<PeerLog>>) -> LocalObjectServer {
    let server = LocalObjectServer::start(ObjectServerConfig::new(OBJECT_ID))
        .await
        .expect("object server");
    if let Some(log) = log {
        server.add_peer_listener(log);
    }
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_connection_binds_and_exchanges_ids() {
    let server_log = Arc::new(PeerLog::default());
    let server = object_server(Some(server_log.clone())).await;
    let discover = ManualDiscover::new();
    discover.publish(server.discovery_record("lamp"));
    let (manager, recorder) = plain_manager(&discover);
    manager.start().await.unwrap();

    assert!(wait_until(WAIT, || recorder.count("connected:") == 1).await);
    let client = manager.active_client_for(OBJECT_ID).expect("active client");
    assert_eq!(client.kind(), TransportKind::Plain);
    assert_eq!(client.security_level(), SecurityLevel::NoSsl);
    assert_eq!(client.remote_id(), OBJECT_ID);
    assert_eq!(client.remote_object().map(|o| o.id().to_string()).as_deref(), Some(OBJECT_ID));
    assert!(client.luid().is_some());
    assert_eq!(manager.connected_clients(), vec![client.clone()]);
    assert_eq!(
        manager.discovery_service_for(&client),
        Some(server.discovery_record("lamp"))
    );
    assert_eq!(manager.available_services().len(), 1);

    // Object side learned the service id from the identity line.
    assert!(wait_until(WAIT, || server.clients().len() == 1).await);
    assert_eq!(server.clients()[0].remote_id(), SERVICE_ID);

    // Lines from the object reach the manager listeners.
    assert_eq!(server.broadcast("state:on").await, 1);
    assert!(wait_until(WAIT, || recorder.count("message:") == 1).await);
    assert_eq!(
        recorder.snapshot().last().map(String::as_str),
        Some("message:11111-22222-33333:state:on")
    );

    // And lines from the service reach the object.
    client.send_line("toggle").await.unwrap();
    assert!(wait_until(WAIT, || server_log.lines.lock().contains(&"toggle".to_string())).await);

    manager.stop().await.unwrap();
    assert_eq!(client.disconnection_reason(), DisconnectionReason::LocalRequest);
    assert!(wait_until(WAIT, || recorder.count("disconnected:") == 1).await);
    assert!(!manager.tracks(&client));
    assert!(manager.local_clients().is_empty());
    assert!(manager.available_services().is_empty());
    assert!(
        wait_until(WAIT, || {
            server_log.reasons.lock().as_slice() == [DisconnectionReason::RemoteRequest]
        })
        .await
    );
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_close_notifies_and_forgets() {
    let server = object_server(None).await;
    let discover = ManualDiscover::new();
    discover.publish(server.discovery_record("lamp"));
    let (manager, recorder) = plain_manager(&discover);
    manager.start().await.unwrap();
    assert!(wait_until(WAIT, || recorder.count("connected:") == 1).await);
    let client = manager.active_client_for(OBJECT_ID).unwrap();

    server.stop().await;
    assert!(wait_until(WAIT, || recorder.count("disconnected:") == 1).await);
    assert_eq!(client.disconnection_reason(), DisconnectionReason::RemoteRequest);
    assert!(!manager.tracks(&client));
    assert!(manager.active_client_for(OBJECT_ID).is_none());
    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_local_services_are_skipped() {
    let server = object_server(None).await;
    let discover = ManualDiscover::new();
    let mut cfg = plain_config();
    cfg.only_localhost = Some(true);
    let manager = LocalClientsManager::builder(SERVICE_ID, cfg)
        .discover(Arc::new(discover.clone()))
        .build()
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    manager.add_client_listener(recorder.clone());
    manager.start().await.unwrap();

    let remote: IpAddr = "192.0.2.10".parse().unwrap();
    discover.publish(DiscoveryService::new("far", remote, server.local_addr().port(), "eth0"));
    discover.publish(server.discovery_record("lamp"));
    assert!(wait_until(WAIT, || recorder.count("connected:") == 1).await);
    assert_eq!(manager.available_services().len(), 2);
    assert_eq!(manager.local_clients().len(), 1);
    assert_eq!(
        manager.local_clients()[0].remote_addr(),
        server.local_addr()
    );

    manager.stop().await.unwrap();
    server.stop().await;
}

struct RefusingRegistry;

#[async_trait]
impl ObjectRegistry for RefusingRegistry {
    async fn create_new_remote_object(
        &self,
        _client: &LocalClient,
        remote_id: &str,
    ) -> Result<RemoteObject> {
        Err(LocalCommError::Registry(format!("unknown object {}", remote_id)))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registry_refusal_discards_client() {
    let server_log = Arc::new(PeerLog::default());
    let server = object_server(Some(server_log.clone())).await;
    let discover = ManualDiscover::new();
    discover.publish(server.discovery_record("lamp"));
    let manager = LocalClientsManager::builder(SERVICE_ID, plain_config())
        .discover(Arc::new(discover.clone()))
        .registry(Arc::new(RefusingRegistry))
        .build()
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    manager.add_client_listener(recorder.clone());
    manager.start().await.unwrap();

    assert!(wait_until(WAIT, || recorder.count("error:registry") == 1).await);
    assert!(wait_until(WAIT, || manager.local_clients().is_empty()).await);
    assert_eq!(recorder.count("connected:"), 0);
    assert!(wait_until(WAIT, || server_log.reasons.lock().len() == 1).await);

    manager.stop().await.unwrap();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backup_takes_over_without_disconnect_event() {
    let first = object_server(None).await;
    let second = object_server(None).await;
    let discover = ManualDiscover::new();
    let (manager, recorder) = plain_manager(&discover);
    manager.start().await.unwrap();

    discover.publish(first.discovery_record("lamp-a"));
    assert!(wait_until(WAIT, || recorder.count("connected:") == 1).await);
    let original = manager.active_client_for(OBJECT_ID).unwrap();
    assert_eq!(original.remote_addr(), first.local_addr());

    // Same object through a second endpoint: parked as backup.
    discover.publish(second.discovery_record("lamp-b"));
    assert!(wait_until(WAIT, || manager.backup_clients_for(OBJECT_ID).len() == 1).await);
    let backup = manager.backup_clients_for(OBJECT_ID).remove(0);
    assert!(backup.is_backup());
    assert!(wait_until(WAIT, || !backup.state().is_connected()).await);
    assert!(!manager.tracks(&backup));
    assert_eq!(recorder.count("connected:"), 1);

    first.stop().await;
    assert!(wait_until(WAIT, || {
        manager
            .active_client_for(OBJECT_ID)
            .map(|c| c.remote_addr() == second.local_addr())
            .unwrap_or(false)
    })
    .await);
    assert!(manager.backup_clients_for(OBJECT_ID).is_empty());
    assert_eq!(recorder.count("disconnected:"), 0);
    assert_eq!(recorder.count("connected:"), 1);
    assert!(!manager.tracks(&original));

    // No backup left: the next loss is reported.
    second.stop().await;
    assert!(wait_until(WAIT, || recorder.count("disconnected:") == 1).await);
    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_does_not_promote_backups() {
    let first = object_server(None).await;
    let second_log = Arc::new(PeerLog::default());
    let second = object_server(Some(second_log.clone())).await;
    let discover = ManualDiscover::new();
    let (manager, recorder) = plain_manager(&discover);
    manager.start().await.unwrap();

    discover.publish(first.discovery_record("lamp-a"));
    assert!(wait_until(WAIT, || recorder.count("connected:") == 1).await);
    discover.publish(second.discovery_record("lamp-b"));
    assert!(wait_until(WAIT, || manager.backup_clients_for(OBJECT_ID).len() == 1).await);
    // The parked backup closed its connection to the second server.
    assert!(wait_until(WAIT, || second_log.reasons.lock().len() == 1).await);

    manager.stop().await.unwrap();
    assert!(wait_until(WAIT, || recorder.count("disconnected:") == 1).await);
    assert!(manager.local_clients().is_empty());
    assert!(manager.backup_clients_for(OBJECT_ID).is_empty());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(second.clients().is_empty());
    assert_eq!(second_log.reasons.lock().len(), 1);

    first.stop().await;
    second.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_promotes_backups_when_not_suppressed() {
    let first = object_server(None).await;
    let second_log = Arc::new(PeerLog::default());
    let second = object_server(Some(second_log.clone())).await;
    let discover = ManualDiscover::new();
    let mut cfg = plain_config();
    cfg.suppress_failover_on_shutdown = Some(false);
    let manager = LocalClientsManager::builder(SERVICE_ID, cfg)
        .discover(Arc::new(discover.clone()))
        .build()
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    manager.add_client_listener(recorder.clone());
    manager.start().await.unwrap();

    discover.publish(first.discovery_record("lamp-a"));
    assert!(wait_until(WAIT, || recorder.count("connected:") == 1).await);
    discover.publish(second.discovery_record("lamp-b"));
    assert!(wait_until(WAIT, || manager.backup_clients_for(OBJECT_ID).len() == 1).await);
    assert!(wait_until(WAIT, || second_log.reasons.lock().len() == 1).await);

    // The backup reconnects while stopping and is closed again before stop returns.
    manager.stop().await.unwrap();
    assert!(manager.local_clients().is_empty());
    assert!(wait_until(WAIT, || second_log.reasons.lock().len() == 2).await);
    assert!(wait_until(WAIT, || recorder.count("disconnected:") == 1).await);
    assert_eq!(recorder.count("connected:"), 1);

    first.stop().await;
    second.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_refused_connect_reports_an_error() {
    let closed_port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let discover = ManualDiscover::new();
    let (manager, recorder) = plain_manager(&discover);
    manager.start().await.unwrap();

    const ATTEMPTS: usize = 20;
    for i in 0..ATTEMPTS {
        discover.publish(DiscoveryService::new(
            format!("dead-{}", i),
            "127.0.0.1".parse().unwrap(),
            closed_port,
            "lo",
        ));
    }
    assert!(
        wait_until(WAIT, || recorder.count("error:") == ATTEMPTS).await,
        "{:?}",
        recorder.snapshot()
    );
    assert_eq!(recorder.count("connected:"), 0);
    assert_eq!(recorder.count("disconnected:"), 0);
    assert!(manager.local_clients().is_empty());
    assert_eq!(manager.available_services().len(), ATTEMPTS);

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_identity_line_is_dropped_without_events() {
    let server_log = Arc::new(PeerLog::default());
    let server = LocalObjectServer::start(ObjectServerConfig::new("not a full id"))
        .await
        .unwrap();
    server.add_peer_listener(server_log.clone());
    let discover = ManualDiscover::new();
    discover.publish(server.discovery_record("lamp"));
    let (manager, recorder) = plain_manager(&discover);
    manager.start().await.unwrap();

    assert!(wait_until(WAIT, || server_log.reasons.lock().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(recorder.snapshot().is_empty(), "{:?}", recorder.snapshot());
    assert!(manager.local_clients().is_empty());
    assert!(manager.active_client_for("not a full id").is_none());

    manager.stop().await.unwrap();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_backup_stays_a_candidate_until_its_service_is_lost() {
    let first = object_server(None).await;
    let second = object_server(None).await;
    let discover = ManualDiscover::new();
    let (manager, recorder) = plain_manager(&discover);
    manager.start().await.unwrap();

    discover.publish(first.discovery_record("lamp-a"));
    assert!(wait_until(WAIT, || recorder.count("connected:") == 1).await);
    discover.publish(second.discovery_record("lamp-b"));
    assert!(wait_until(WAIT, || manager.backup_clients_for(OBJECT_ID).len() == 1).await);

    // The backup endpoint goes away silently, then the active one drops.
    second.stop().await;
    first.stop().await;
    assert!(wait_until(WAIT, || recorder.count("disconnected:") == 1).await);
    assert!(manager.active_client_for(OBJECT_ID).is_none());
    assert_eq!(manager.backup_clients_for(OBJECT_ID).len(), 1);
    // Only the refused promotion attempt; the original drop is not an error.
    assert!(wait_until(WAIT, || recorder.count("error:") == 1).await);

    discover.withdraw(&second.discovery_record("lamp-b"));
    assert!(wait_until(WAIT, || manager.backup_clients_for(OBJECT_ID).is_empty()).await);
    manager.stop().await.unwrap();
}
