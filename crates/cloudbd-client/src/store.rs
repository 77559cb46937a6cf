//! Remote store capability traits

use bytes::Bytes;
use cloudbd_common::{ContainerId, ObjectId, Result};
use serde::{Deserialize, Serialize};

/// A container returned by a name lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Store-issued identifier
    pub id: ContainerId,
    /// Container name
    pub name: String,
    /// Whether the authorized principal may create and update objects in it
    pub writable: bool,
}

/// An object returned by a name lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Store-issued identifier
    pub id: ObjectId,
    /// Object name
    pub name: String,
    /// Content length in bytes
    pub size: u64,
}

/// Authorized handle to a remote object store
///
/// A handle is owned by a single thread at a time; implementations need not
/// be `Sync`. Any call may fail with
/// [`Error::RateLimited`](cloudbd_common::Error::RateLimited), which callers
/// tell apart from every other failure with `is_rate_limited()`.
pub trait RemoteStoreClient: Send {
    /// Find containers with exactly this name
    fn list_containers(&self, name: &str) -> Result<Vec<ContainerInfo>>;

    /// Create a container and return its identifier
    fn create_container(&self, name: &str) -> Result<ContainerId>;

    /// Find objects with exactly this name inside a container
    fn list_objects(&self, container: &ContainerId, name: &str) -> Result<Vec<ObjectInfo>>;

    /// Fetch the full content of an object
    fn get_object(&self, object: &ObjectId) -> Result<Bytes>;

    /// Create a new object; names are not required to be unique
    fn create_object(
        &self,
        container: &ContainerId,
        name: &str,
        mime: &str,
        data: Bytes,
    ) -> Result<ObjectId>;

    /// Replace the content of an existing object
    fn update_object(&self, object: &ObjectId, data: Bytes) -> Result<()>;
}

/// Source of authorized store clients
///
/// Credential acquisition (interactive or cached) happens behind this trait.
/// Every call returns an independent client.
pub trait Authenticator: Send + Sync {
    fn obtain_client(&self) -> Result<Box<dyn RemoteStoreClient>>;
}
