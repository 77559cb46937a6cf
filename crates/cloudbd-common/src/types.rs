//! Core type definitions for cloudbd
//!
//! Identifiers handed out by the remote store, the persisted device
//! metadata record, and the naming conventions used inside a device
//! container.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Metadata schema version understood by this build
pub const METADATA_VERSION: u32 = 1;

/// Name of the metadata object inside a device container
pub const METADATA_OBJECT_NAME: &str = "config";

/// MIME type of the metadata object
pub const METADATA_MIME: &str = "application/json";

/// MIME type of block objects
pub const BLOCK_MIME: &str = "application/octet-stream";

/// Block number within a device
pub type BlockNo = u64;

/// Opaque identifier of a container in the remote store
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct ContainerId(String);

impl ContainerId {
    /// Wrap a store-issued identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque identifier of an object in the remote store
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct ObjectId(String);

impl ObjectId {
    /// Wrap a store-issued identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Deterministic object name for a block
///
/// Lookups go by name, so the mapping survives restarts without being
/// persisted anywhere.
#[must_use]
pub fn block_object_name(block: BlockNo) -> String {
    format!("block_{block}")
}

/// I/O priority level for scheduling
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Device geometry persisted once per container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Schema version, must equal [`METADATA_VERSION`]
    pub version: u32,
    /// Size of every block in bytes
    pub block_size: u64,
    /// Number of blocks on the device
    pub block_count: u64,
}

impl DeviceMetadata {
    /// Build the metadata for a new device
    ///
    /// `total_size` is truncated down to a multiple of `block_size`. Returns
    /// `None` when the geometry cannot describe at least one block.
    #[must_use]
    pub const fn for_new_device(block_size: u64, total_size: u64) -> Option<Self> {
        if block_size == 0 || total_size < block_size {
            return None;
        }
        Some(Self {
            version: METADATA_VERSION,
            block_size,
            block_count: total_size / block_size,
        })
    }

    /// Usable size of the device in bytes
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.block_size * self.block_count
    }

    /// Check whether this record was written by a compatible build
    #[must_use]
    pub const fn is_current_version(&self) -> bool {
        self.version == METADATA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_object_name() {
        assert_eq!(block_object_name(0), "block_0");
        assert_eq!(block_object_name(4095), "block_4095");
    }

    #[test]
    fn test_ids_as_ordered_keys() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(ObjectId::new("b"), 2);
        map.insert(ObjectId::new("a"), 1);
        assert_eq!(map.keys().next(), Some(&ObjectId::new("a")));
        assert!(ContainerId::new("c1") < ContainerId::new("c2"));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_metadata_truncates_total_size() {
        let meta = DeviceMetadata::for_new_device(4096, 10_000).unwrap();
        assert_eq!(meta.block_count, 2);
        assert_eq!(meta.total_size(), 8192);
        assert!(meta.is_current_version());
    }

    #[test]
    fn test_metadata_rejects_bad_geometry() {
        assert!(DeviceMetadata::for_new_device(0, 4096).is_none());
        assert!(DeviceMetadata::for_new_device(4096, 100).is_none());
    }

    #[test]
    fn test_metadata_json_layout() {
        let meta = DeviceMetadata {
            version: METADATA_VERSION,
            block_size: 512,
            block_count: 8,
        };
        let json = serde_json::to_value(meta).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["block_size"], 512);
        assert_eq!(json["block_count"], 8);
    }

    #[test]
    fn test_ids_display() {
        assert_eq!(ObjectId::new("abc").to_string(), "abc");
        assert_eq!(ContainerId::from("dev".to_string()).as_str(), "dev");
    }
}
