// src/objs/registry.rs

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{LocalCommError, Result};
use crate::network::local_client::LocalClient;
use crate::objs::remote_object::{CloudConnection, NoCloud, RemoteObject};

/// Resolves (or creates) the remote object a freshly identified client belongs to.
/// An error makes the manager discard the client.
#[async_trait]
pub trait ObjectRegistry: Send + Sync {
    async fn create_new_remote_object(
        &self,
        client: &LocalClient,
        remote_id: &str,
    ) -> Result<RemoteObject>;
}

/// Registry keeping every object it ever created, keyed by object id.
pub struct InMemoryRegistry {
    objects: Mutex<HashMap<String, RemoteObject>>,
    cloud: Arc<dyn CloudConnection>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NoCloud))
    }
}

impl InMemoryRegistry {
    pub fn new(cloud: Arc<dyn CloudConnection>) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            cloud,
        }
    }

    pub fn get(&self, id: &str) -> Option<RemoteObject> {
        self.objects.lock().get(id).cloned()
    }

    pub fn objects(&self) -> Vec<RemoteObject> {
        let mut all: Vec<RemoteObject> = self.objects.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }
}

#[async_trait]
impl ObjectRegistry for InMemoryRegistry {
    async fn create_new_remote_object(
        &self,
        client: &LocalClient,
        remote_id: &str,
    ) -> Result<RemoteObject> {
        let manager = client
            .manager()
            .ok_or_else(|| LocalCommError::Registry("clients manager dropped".into()))?;
        let mut objects = self.objects.lock();
        if let Some(existing) = objects.get(remote_id) {
            return Ok(existing.clone());
        }
        let obj = RemoteObject::new(remote_id, &manager, self.cloud.clone());
        objects.insert(remote_id.to_string(), obj.clone());
        Ok(obj)
    }
}
