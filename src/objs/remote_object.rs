// src/objs/remote_object.rs
//
// Service-side handle of one remote object. Its local connectivity is derived
// from the clients manager; cloud connectivity comes from a pluggable
// `CloudConnection`.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{LocalCommError, Result};
use crate::events::model::LogLevel;
use crate::network::clients_manager::{
    ListenerId, LocalClientListener, LocalClientsManager, WeakManager,
};
use crate::network::events::emit_network_event;
use crate::network::local_client::LocalClient;

/// Cloud side of an object's connectivity. Only its on/off state matters here.
pub trait CloudConnection: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// No cloud link at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCloud;

impl CloudConnection for NoCloud {
    fn is_connected(&self) -> bool {
        false
    }
}

/// Connectivity notifications of one remote object. All methods default to no-ops.
pub trait RemoteObjectListener: Send + Sync {
    fn on_local_connected(&self, _obj: &RemoteObject, _client: &LocalClient) {}
    fn on_local_disconnected(&self, _obj: &RemoteObject, _client: &LocalClient) {}
    fn on_local_message(&self, _obj: &RemoteObject, _client: &LocalClient, _line: &str) {}
    fn on_cloud_connected(&self, _obj: &RemoteObject) {}
    fn on_cloud_disconnected(&self, _obj: &RemoteObject) {}
}

struct RemoteObjectInner {
    id: String,
    name: RwLock<Option<String>>,
    comm: ObjComm,
}

/// A remote object known to this service, shared by every client bound to it.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<RemoteObjectInner>,
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("id", &self.inner.id)
            .field("local", &self.inner.comm.is_local_connected())
            .field("cloud", &self.inner.comm.is_cloud_connected())
            .finish()
    }
}

impl PartialEq for RemoteObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for RemoteObject {}

impl RemoteObject {
    pub fn new(
        id: impl Into<String>,
        manager: &LocalClientsManager,
        cloud: Arc<dyn CloudConnection>,
    ) -> Self {
        let id = id.into();
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteObjectInner>| RemoteObjectInner {
            id: id.clone(),
            name: RwLock::new(None),
            comm: ObjComm::new(id, weak.clone(), manager, cloud),
        });
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Display name, falling back to the id.
    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .clone()
            .unwrap_or_else(|| self.inner.id.clone())
    }
    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.write() = Some(name.into());
    }

    pub fn comm(&self) -> &ObjComm {
        &self.inner.comm
    }
}

struct ObjCommShared {
    object_id: String,
    object: Weak<RemoteObjectInner>,
    manager: WeakManager,
    cloud: Arc<dyn CloudConnection>,
    cloud_flag: Mutex<bool>,
    listeners: RwLock<Vec<Arc<dyn RemoteObjectListener>>>,
    registration: Mutex<Option<ListenerId>>,
}

impl ObjCommShared {
    fn object(&self) -> Option<RemoteObject> {
        self.object.upgrade().map(|inner| RemoteObject { inner })
    }

    fn listeners(&self) -> Vec<Arc<dyn RemoteObjectListener>> {
        self.listeners.read().clone()
    }
}

impl Drop for ObjCommShared {
    fn drop(&mut self) {
        let id = self.registration.get_mut().take();
        if let (Some(id), Some(manager)) = (id, self.manager.upgrade()) {
            manager.remove_client_listener(id);
        }
    }
}

/// Forwards manager notifications that concern one object.
struct ObjectFilter {
    comm: Weak<ObjCommShared>,
}

impl ObjectFilter {
    fn target(&self, obj: &RemoteObject) -> Option<(Arc<ObjCommShared>, RemoteObject)> {
        let comm = self.comm.upgrade()?;
        if obj.id() != comm.object_id {
            return None;
        }
        let own = comm.object()?;
        Some((comm, own))
    }
}

impl LocalClientListener for ObjectFilter {
    fn on_local_connected(&self, obj: &RemoteObject, client: &LocalClient) {
        if let Some((comm, own)) = self.target(obj) {
            for l in comm.listeners() {
                l.on_local_connected(&own, client);
            }
        }
    }

    fn on_local_disconnected(&self, obj: &RemoteObject, client: &LocalClient) {
        if let Some((comm, own)) = self.target(obj) {
            for l in comm.listeners() {
                l.on_local_disconnected(&own, client);
            }
        }
    }

    fn on_local_message(&self, obj: &RemoteObject, client: &LocalClient, line: &str) {
        if let Some((comm, own)) = self.target(obj) {
            for l in comm.listeners() {
                l.on_local_message(&own, client, line);
            }
        }
    }
}

/// Connectivity facade of a remote object.
pub struct ObjComm {
    shared: Arc<ObjCommShared>,
}

impl ObjComm {
    fn new(
        object_id: String,
        object: Weak<RemoteObjectInner>,
        manager: &LocalClientsManager,
        cloud: Arc<dyn CloudConnection>,
    ) -> Self {
        let shared = Arc::new(ObjCommShared {
            object_id,
            object,
            manager: manager.downgrade(),
            cloud,
            cloud_flag: Mutex::new(false),
            listeners: RwLock::new(Vec::new()),
            registration: Mutex::new(None),
        });
        let id = manager.add_client_listener(Arc::new(ObjectFilter {
            comm: Arc::downgrade(&shared),
        }));
        *shared.registration.lock() = Some(id);
        Self { shared }
    }

    pub fn add_listener(&self, listener: Arc<dyn RemoteObjectListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// True iff the manager has an active client for this object.
    pub fn is_local_connected(&self) -> bool {
        self.active_local_client().is_some()
    }

    pub fn is_cloud_connected(&self) -> bool {
        self.shared.cloud.is_connected() && *self.shared.cloud_flag.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.is_local_connected() || self.is_cloud_connected()
    }

    pub fn active_local_client(&self) -> Option<LocalClient> {
        self.shared
            .manager
            .upgrade()?
            .active_client_for(&self.shared.object_id)
    }

    pub fn local_backup_clients(&self) -> Vec<LocalClient> {
        self.shared
            .manager
            .upgrade()
            .map(|m| m.backup_clients_for(&self.shared.object_id))
            .unwrap_or_default()
    }

    /// Send one line to the object over its active local connection.
    pub async fn send_local(&self, line: &str) -> Result<()> {
        let client = self
            .active_local_client()
            .ok_or(LocalCommError::NotConnected)?;
        client.send_line(line).await
    }

    /// Record the cloud link state; listeners hear about changes only.
    pub fn set_cloud_connected(&self, connected: bool) {
        {
            let mut flag = self.shared.cloud_flag.lock();
            if *flag == connected {
                return;
            }
            *flag = connected;
        }
        emit_network_event(
            "objs",
            LogLevel::Debug,
            if connected { "cloud_connected" } else { "cloud_disconnected" },
            None,
            Some(format!("object={}", self.shared.object_id)),
        );
        let Some(own) = self.shared.object() else {
            return;
        };
        for l in self.shared.listeners() {
            if connected {
                l.on_cloud_connected(&own);
            } else {
                l.on_cloud_disconnected(&own);
            }
        }
    }
}
