//! Block number to remote object mapping
//!
//! The table starts with every slot [`Slot::Unknown`] and learns each slot
//! the first time it is touched, by looking up the block's deterministic
//! name in the device container.
//!
//! One mutex guards the whole table and is held across the remote round
//! trip. Two workers can therefore never both decide a block is unmapped
//! and both create an object for it.

use crate::error::{BlockError, BlockResult};

use bytes::Bytes;
use cloudbd_client::RemoteStoreClient;
use cloudbd_common::{BLOCK_MIME, BlockNo, ContainerId, ObjectId, block_object_name};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Resolution state of one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Not looked up yet
    Unknown,
    /// No backing object; reads as zeros
    Unmapped,
    /// Backed by this object
    Mapped(ObjectId),
}

/// Lazily populated, thread-safe block map
///
/// Only blocks that have been looked up take memory; absent entries are
/// [`Slot::Unknown`].
pub struct BlockIndex {
    container: ContainerId,
    block_size: u64,
    block_count: u64,
    slots: Mutex<HashMap<BlockNo, Slot>>,
}

impl BlockIndex {
    /// Create an index with every slot unknown
    pub fn new(container: ContainerId, block_size: u64, block_count: u64) -> Self {
        Self {
            container,
            block_size,
            block_count,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Container holding the block objects
    pub const fn container(&self) -> &ContainerId {
        &self.container
    }

    /// Number of slots
    pub const fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Cached state of a slot, without any remote lookup
    pub fn slot(&self, index: BlockNo) -> BlockResult<Slot> {
        self.check_bounds(index)?;
        Ok(self
            .slots
            .lock()
            .get(&index)
            .cloned()
            .unwrap_or(Slot::Unknown))
    }

    /// Find the object backing `index`, or `None` if the block is unmapped
    ///
    /// More than one object with the block's name is reported as
    /// [`BlockError::AmbiguousState`] and leaves the slot unknown.
    pub fn resolve(
        &self,
        client: &dyn RemoteStoreClient,
        index: BlockNo,
    ) -> BlockResult<Option<ObjectId>> {
        self.check_bounds(index)?;
        let mut slots = self.slots.lock();

        match slots.get(&index) {
            Some(Slot::Mapped(id)) => return Ok(Some(id.clone())),
            Some(Slot::Unmapped) => return Ok(None),
            Some(Slot::Unknown) | None => {}
        }

        let resolved = self.lookup(client, index)?;
        debug!("Resolved block {index}: {resolved:?}");
        slots.insert(index, resolved.clone());
        Ok(match resolved {
            Slot::Mapped(id) => Some(id),
            _ => None,
        })
    }

    /// Create the backing object for an unmapped block
    ///
    /// Allocation never overwrites: a block that is already mapped, cached or
    /// found in the store, fails with [`BlockError::AlreadyMapped`]. Without
    /// `data` the object is zero-filled.
    pub fn allocate(
        &self,
        client: &dyn RemoteStoreClient,
        index: BlockNo,
        data: Option<Bytes>,
    ) -> BlockResult<ObjectId> {
        self.check_bounds(index)?;

        let data = match data {
            Some(data) if data.len() as u64 != self.block_size => {
                return Err(BlockError::InvalidLength {
                    expected: self.block_size,
                    actual: data.len() as u64,
                });
            }
            Some(data) => data,
            None => Bytes::from(vec![0u8; self.block_size as usize]),
        };

        let mut slots = self.slots.lock();
        match slots.get(&index) {
            Some(Slot::Mapped(_)) => return Err(BlockError::AlreadyMapped(index)),
            Some(Slot::Unmapped) => {}
            Some(Slot::Unknown) | None => {
                let found = self.lookup(client, index)?;
                let mapped = matches!(found, Slot::Mapped(_));
                slots.insert(index, found);
                if mapped {
                    return Err(BlockError::AlreadyMapped(index));
                }
            }
        }

        let id = client.create_object(
            &self.container,
            &block_object_name(index),
            BLOCK_MIME,
            data,
        )?;

        debug!("Allocated block {index} as {id}");
        slots.insert(index, Slot::Mapped(id.clone()));
        Ok(id)
    }

    /// Number of slots currently known to be mapped
    pub fn mapped_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| matches!(s, Slot::Mapped(_)))
            .count()
    }

    /// List the store for the block's name; caller holds the table lock
    fn lookup(&self, client: &dyn RemoteStoreClient, index: BlockNo) -> BlockResult<Slot> {
        let name = block_object_name(index);
        let mut found = client.list_objects(&self.container, &name)?;
        match found.len() {
            0 => Ok(Slot::Unmapped),
            1 => Ok(Slot::Mapped(found.remove(0).id)),
            n => Err(BlockError::AmbiguousState(format!(
                "{n} objects named {name} in container {}",
                self.container
            ))),
        }
    }

    fn check_bounds(&self, index: BlockNo) -> BlockResult<()> {
        if index >= self.block_count {
            return Err(BlockError::OutOfBounds {
                index,
                block_count: self.block_count,
            });
        }
        Ok(())
    }
}
