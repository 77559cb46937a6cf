//! Filesystem-backed object store
//!
//! ```text
//! <root>/
//! ├── <container-uuid>/
//! │   ├── container.json        {"name": "..."}
//! │   ├── <object-uuid>.meta    {"name": "...", "mime": "..."}
//! │   └── <object-uuid>.data    raw content
//! └── ...
//! ```
//!
//! Object identifiers have the form `<container-uuid>/<object-uuid>`.

use crate::store::{Authenticator, ContainerInfo, ObjectInfo, RemoteStoreClient};

use bytes::Bytes;
use cloudbd_common::{ContainerId, Error, ObjectId, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const CONTAINER_FILE: &str = "container.json";
const META_EXT: &str = "meta";
const DATA_EXT: &str = "data";

#[derive(Debug, Serialize, Deserialize)]
struct ContainerRecord {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectRecord {
    name: String,
    mime: String,
}

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open a store rooted at an existing directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::storage(format!(
                "store root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &ContainerId) -> Result<PathBuf> {
        let id = Uuid::parse_str(container.as_str())
            .map_err(|_| Error::ContainerNotFound(container.to_string()))?;
        let dir = self.root.join(id.to_string());
        if !dir.join(CONTAINER_FILE).is_file() {
            return Err(Error::ContainerNotFound(container.to_string()));
        }
        Ok(dir)
    }

    /// Split `<container>/<object>` into the container dir and object stem
    fn object_paths(&self, object: &ObjectId) -> Result<(PathBuf, String)> {
        let (container, stem) = object
            .as_str()
            .split_once('/')
            .ok_or_else(|| Error::ObjectNotFound(object.to_string()))?;
        let stem = Uuid::parse_str(stem)
            .map_err(|_| Error::ObjectNotFound(object.to_string()))?
            .to_string();
        let dir = self
            .container_dir(&ContainerId::new(container))
            .map_err(|_| Error::ObjectNotFound(object.to_string()))?;
        if !dir.join(format!("{stem}.{META_EXT}")).is_file() {
            return Err(Error::ObjectNotFound(object.to_string()));
        }
        Ok((dir, stem))
    }

    fn is_writable(dir: &Path) -> Result<bool> {
        Ok(!fs::metadata(dir)?.permissions().readonly())
    }

    /// Write through a temporary file so readers never see partial content
    ///
    /// Each call gets its own temporary name; concurrent writers of one
    /// object race only on the final rename.
    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl RemoteStoreClient for DirStore {
    fn list_containers(&self, name: &str) -> Result<Vec<ContainerInfo>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let record_path = path.join(CONTAINER_FILE);
            if !record_path.is_file() {
                continue;
            }
            let record: ContainerRecord = serde_json::from_slice(&fs::read(&record_path)?)?;
            if record.name != name {
                continue;
            }
            let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            found.push(ContainerInfo {
                id: ContainerId::new(id),
                name: record.name,
                writable: Self::is_writable(&path)?,
            });
        }
        Ok(found)
    }

    fn create_container(&self, name: &str) -> Result<ContainerId> {
        let id = Uuid::new_v4().to_string();
        let dir = self.root.join(&id);
        fs::create_dir(&dir)?;
        let record = serde_json::to_vec(&ContainerRecord {
            name: name.to_string(),
        })?;
        Self::write_atomic(&dir.join(CONTAINER_FILE), &record)?;
        debug!("Created container {name} at {}", dir.display());
        Ok(ContainerId::new(id))
    }

    fn list_objects(&self, container: &ContainerId, name: &str) -> Result<Vec<ObjectInfo>> {
        let dir = self.container_dir(container)?;
        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            let record: ObjectRecord = serde_json::from_slice(&fs::read(&path)?)?;
            if record.name != name {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let size = fs::metadata(dir.join(format!("{stem}.{DATA_EXT}")))
                .map(|m| m.len())
                .unwrap_or(0);
            found.push(ObjectInfo {
                id: ObjectId::new(format!("{container}/{stem}")),
                name: record.name,
                size,
            });
        }
        Ok(found)
    }

    fn get_object(&self, object: &ObjectId) -> Result<Bytes> {
        let (dir, stem) = self.object_paths(object)?;
        Ok(Bytes::from(fs::read(dir.join(format!("{stem}.{DATA_EXT}")))?))
    }

    fn create_object(
        &self,
        container: &ContainerId,
        name: &str,
        mime: &str,
        data: Bytes,
    ) -> Result<ObjectId> {
        let dir = self.container_dir(container)?;
        if !Self::is_writable(&dir)? {
            return Err(Error::AccessDenied(container.to_string()));
        }

        let stem = Uuid::new_v4().to_string();
        // Data first: an object is only listed once its meta file exists
        Self::write_atomic(&dir.join(format!("{stem}.{DATA_EXT}")), &data)?;
        let record = serde_json::to_vec(&ObjectRecord {
            name: name.to_string(),
            mime: mime.to_string(),
        })?;
        Self::write_atomic(&dir.join(format!("{stem}.{META_EXT}")), &record)?;

        Ok(ObjectId::new(format!("{container}/{stem}")))
    }

    fn update_object(&self, object: &ObjectId, data: Bytes) -> Result<()> {
        let (dir, stem) = self.object_paths(object)?;
        if !Self::is_writable(&dir)? {
            return Err(Error::AccessDenied(object.to_string()));
        }
        Self::write_atomic(&dir.join(format!("{stem}.{DATA_EXT}")), &data)
    }
}

/// Hands out [`DirStore`] clients for a fixed root directory
#[derive(Debug, Clone)]
pub struct DirAuthenticator {
    root: PathBuf,
}

impl DirAuthenticator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Authenticator for DirAuthenticator {
    fn obtain_client(&self) -> Result<Box<dyn RemoteStoreClient>> {
        let store = DirStore::open(&self.root)
            .map_err(|e| Error::Authentication(format!("{}: {e}", self.root.display())))?;
        Ok(Box::new(store))
    }
}
