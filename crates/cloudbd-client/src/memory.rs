//! In-memory object store
//!
//! Every clone of a [`MemoryStore`] shares the same backend, so the store can
//! act as its own [`Authenticator`]: each issued client is a clone. Tests use
//! the fault-injection hooks to simulate throttling and corrupted state.

use crate::store::{Authenticator, ContainerInfo, ObjectInfo, RemoteStoreClient};

use bytes::Bytes;
use cloudbd_common::{ContainerId, Error, ObjectId, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Remote store operation, used for fault injection and call accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListContainers,
    CreateContainer,
    ListObjects,
    GetObject,
    CreateObject,
    UpdateObject,
}

struct ContainerEntry {
    name: String,
    writable: bool,
}

struct StoredObject {
    container: ContainerId,
    name: String,
    mime: String,
    data: Bytes,
}

#[derive(Default)]
struct Backend {
    containers: BTreeMap<ContainerId, ContainerEntry>,
    objects: BTreeMap<ObjectId, StoredObject>,
    /// Remaining injected rate-limit rejections per operation
    throttled: HashMap<StoreOp, u32>,
    /// Completed or rejected calls per operation
    calls: HashMap<StoreOp, u64>,
    latency: Option<Duration>,
}

/// Shared in-process object store
#[derive(Clone, Default)]
pub struct MemoryStore {
    backend: Arc<Mutex<Backend>>,
    clients_issued: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` calls of `op` with a rate-limit error
    pub fn rate_limit_next(&self, op: StoreOp, count: u32) {
        *self.backend.lock().throttled.entry(op).or_default() += count;
    }

    /// Delay every data call (get, create, update) by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.backend.lock().latency = Some(latency);
    }

    /// Number of calls made for `op`, including rejected ones
    pub fn calls(&self, op: StoreOp) -> u64 {
        self.backend.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of clients handed out through [`Authenticator::obtain_client`]
    pub fn clients_issued(&self) -> u64 {
        self.clients_issued.load(Ordering::Relaxed)
    }

    /// Add a container directly, bypassing accounting
    pub fn insert_container(&self, name: &str, writable: bool) -> ContainerId {
        let id = ContainerId::new(Uuid::new_v4().to_string());
        self.backend.lock().containers.insert(
            id.clone(),
            ContainerEntry {
                name: name.to_string(),
                writable,
            },
        );
        id
    }

    /// Change the writability of a container
    pub fn set_writable(&self, container: &ContainerId, writable: bool) {
        if let Some(entry) = self.backend.lock().containers.get_mut(container) {
            entry.writable = writable;
        }
    }

    /// Add an object directly, bypassing accounting; duplicate names are allowed
    pub fn insert_object(&self, container: &ContainerId, name: &str, data: Bytes) -> ObjectId {
        let id = ObjectId::new(Uuid::new_v4().to_string());
        self.backend.lock().objects.insert(
            id.clone(),
            StoredObject {
                container: container.clone(),
                name: name.to_string(),
                mime: "application/octet-stream".to_string(),
                data,
            },
        );
        id
    }

    /// Overwrite an object's content directly, bypassing accounting
    pub fn replace_object(&self, object: &ObjectId, data: Bytes) {
        if let Some(stored) = self.backend.lock().objects.get_mut(object) {
            stored.data = data;
        }
    }

    /// Content of an object, if it exists
    pub fn object_data(&self, object: &ObjectId) -> Option<Bytes> {
        self.backend.lock().objects.get(object).map(|o| o.data.clone())
    }

    /// MIME type recorded for an object
    pub fn object_mime(&self, object: &ObjectId) -> Option<String> {
        self.backend.lock().objects.get(object).map(|o| o.mime.clone())
    }

    /// Identifiers of every object in a container with the given name
    pub fn objects_named(&self, container: &ContainerId, name: &str) -> Vec<ObjectId> {
        self.backend
            .lock()
            .objects
            .iter()
            .filter(|(_, o)| &o.container == container && o.name == name)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of objects stored in a container
    pub fn object_count(&self, container: &ContainerId) -> usize {
        self.backend
            .lock()
            .objects
            .values()
            .filter(|o| &o.container == container)
            .count()
    }

    /// Number of containers with the given name
    pub fn container_count(&self, name: &str) -> usize {
        self.backend
            .lock()
            .containers
            .values()
            .filter(|c| c.name == name)
            .count()
    }

    /// Count the call and consume one injected rejection if any is pending
    fn admit(&self, op: StoreOp) -> Result<()> {
        let latency = {
            let mut backend = self.backend.lock();
            *backend.calls.entry(op).or_default() += 1;
            if let Some(remaining) = backend.throttled.get_mut(&op) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::RateLimited(format!("{op:?} throttled")));
                }
            }
            backend.latency
        };

        if let Some(latency) = latency {
            if matches!(
                op,
                StoreOp::GetObject | StoreOp::CreateObject | StoreOp::UpdateObject
            ) {
                std::thread::sleep(latency);
            }
        }
        Ok(())
    }

    fn check_writable(backend: &Backend, container: &ContainerId) -> Result<()> {
        match backend.containers.get(container) {
            None => Err(Error::ContainerNotFound(container.to_string())),
            Some(entry) if !entry.writable => Err(Error::AccessDenied(container.to_string())),
            Some(_) => Ok(()),
        }
    }
}

impl RemoteStoreClient for MemoryStore {
    fn list_containers(&self, name: &str) -> Result<Vec<ContainerInfo>> {
        self.admit(StoreOp::ListContainers)?;
        Ok(self
            .backend
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| c.name == name)
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: c.name.clone(),
                writable: c.writable,
            })
            .collect())
    }

    fn create_container(&self, name: &str) -> Result<ContainerId> {
        self.admit(StoreOp::CreateContainer)?;
        Ok(self.insert_container(name, true))
    }

    fn list_objects(&self, container: &ContainerId, name: &str) -> Result<Vec<ObjectInfo>> {
        self.admit(StoreOp::ListObjects)?;
        let backend = self.backend.lock();
        if !backend.containers.contains_key(container) {
            return Err(Error::ContainerNotFound(container.to_string()));
        }
        Ok(backend
            .objects
            .iter()
            .filter(|(_, o)| &o.container == container && o.name == name)
            .map(|(id, o)| ObjectInfo {
                id: id.clone(),
                name: o.name.clone(),
                size: o.data.len() as u64,
            })
            .collect())
    }

    fn get_object(&self, object: &ObjectId) -> Result<Bytes> {
        self.admit(StoreOp::GetObject)?;
        self.backend
            .lock()
            .objects
            .get(object)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::ObjectNotFound(object.to_string()))
    }

    fn create_object(
        &self,
        container: &ContainerId,
        name: &str,
        mime: &str,
        data: Bytes,
    ) -> Result<ObjectId> {
        self.admit(StoreOp::CreateObject)?;
        let mut backend = self.backend.lock();
        Self::check_writable(&backend, container)?;

        let id = ObjectId::new(Uuid::new_v4().to_string());
        backend.objects.insert(
            id.clone(),
            StoredObject {
                container: container.clone(),
                name: name.to_string(),
                mime: mime.to_string(),
                data,
            },
        );
        Ok(id)
    }

    fn update_object(&self, object: &ObjectId, data: Bytes) -> Result<()> {
        self.admit(StoreOp::UpdateObject)?;
        let mut backend = self.backend.lock();
        let container = backend
            .objects
            .get(object)
            .map(|o| o.container.clone())
            .ok_or_else(|| Error::ObjectNotFound(object.to_string()))?;
        Self::check_writable(&backend, &container)?;

        if let Some(stored) = backend.objects.get_mut(object) {
            stored.data = data;
        }
        Ok(())
    }
}

impl Authenticator for MemoryStore {
    fn obtain_client(&self) -> Result<Box<dyn RemoteStoreClient>> {
        self.clients_issued.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(self.clone()))
    }
}
