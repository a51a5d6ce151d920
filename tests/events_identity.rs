use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use localcomm::events::{dispatcher, ConnectionEvent, LogEvent, LogSink};
use localcomm::network::{LocalObjectServer, ManualDiscover, ObjectServerConfig};

mod common;
use common::{plain_manager, wait_until};

#[derive(Default)]
struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

#[async_trait::async_trait]
impl LogSink for MemorySink {
    async fn handle(&self, event: &LogEvent) {
        self.events.lock().push(event.clone());
    }
}

impl MemorySink {
    fn manager_actions(&self) -> Vec<ConnectionEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LogEvent::Connection(c) if c.meta.component == "local_clients" => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, action: &str) -> usize {
        self.manager_actions().iter().filter(|c| c.action == action).count()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identity_failure_is_logged_once() {
    let mem = Arc::new(MemorySink::default());
    dispatcher::init_events(vec![mem.clone()], 256).await;

    let server = LocalObjectServer::start(ObjectServerConfig::new("not a full id"))
        .await
        .unwrap();
    let discover = ManualDiscover::new();
    discover.publish(server.discovery_record("lamp"));
    let (manager, _recorder) = plain_manager(&discover);
    manager.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || mem.count("client_closed") == 1).await);
    assert_eq!(mem.count("identity_failed"), 1);
    assert_eq!(mem.count("client_connected"), 1);
    assert_eq!(mem.count("client_disconnected"), 0);
    assert_eq!(mem.count("client_bound"), 0);

    manager.stop().await.unwrap();
    server.stop().await;
}
