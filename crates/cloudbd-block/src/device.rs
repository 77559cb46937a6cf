//! Block device facade
//!
//! [`BlockDevice::open`] binds to a container in the remote store, loads or
//! initializes the persisted geometry and starts the worker pool. All block
//! I/O goes through the shared priority queue in one of three forms:
//!
//! - blocking: [`read`](BlockDevice::read) / [`write`](BlockDevice::write)
//! - callback: [`read_with`](BlockDevice::read_with) / [`write_with`](BlockDevice::write_with)
//! - future: [`read_async`](BlockDevice::read_async) / [`write_async`](BlockDevice::write_async)
//!
//! Arguments are validated before anything is queued, so a bad index or
//! payload never reaches the store.

use crate::completion::{CompletionSink, IoHandle};
use crate::error::{BlockError, BlockResult};
use crate::index::BlockIndex;
use crate::queue::WorkQueue;
use crate::retry::{RetryPolicy, ThreadSleeper};
use crate::stats::{DeviceStats, StatsSnapshot};
use crate::worker::{WorkItem, WorkerPool, WorkerShared};

use bytes::Bytes;
use cloudbd_client::{Authenticator, RemoteStoreClient};
use cloudbd_common::{
    BlockNo, ContainerId, DeviceConfig, DeviceMetadata, METADATA_MIME, METADATA_OBJECT_NAME,
    METADATA_VERSION, ObjectId, Priority,
};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Asks for geometry values missing from the configuration
///
/// Only consulted when a device is initialized for the first time.
pub trait GeometryPrompt {
    fn ask(&self, question: &str) -> BlockResult<u64>;
}

/// Prompt that always fails; geometry must come from configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl GeometryPrompt for NoPrompt {
    fn ask(&self, question: &str) -> BlockResult<u64> {
        Err(BlockError::Configuration(format!(
            "{question}: not configured and no prompt available"
        )))
    }
}

/// Fixed-size block device backed by a remote object store
pub struct BlockDevice {
    container: ContainerId,
    metadata: DeviceMetadata,
    uuid: String,
    queue: Arc<WorkQueue<WorkItem>>,
    index: Arc<BlockIndex>,
    stats: Arc<DeviceStats>,
    pool: Mutex<Option<WorkerPool>>,
    closed: AtomicBool,
}

impl BlockDevice {
    /// Open a device; geometry for a new device must be configured
    pub fn open(config: &DeviceConfig, auth: &dyn Authenticator) -> BlockResult<Self> {
        Self::open_with_prompt(config, auth, &NoPrompt)
    }

    /// Open a device, asking `prompt` for geometry the configuration lacks
    pub fn open_with_prompt(
        config: &DeviceConfig,
        auth: &dyn Authenticator,
        prompt: &dyn GeometryPrompt,
    ) -> BlockResult<Self> {
        config.validate().map_err(|e| match e {
            cloudbd_common::Error::Configuration(msg) => BlockError::Configuration(msg),
            other => BlockError::from(other),
        })?;

        let retry = RetryPolicy::from_config(&config.retry);
        let client = auth.obtain_client()?;
        let container = resolve_container(client.as_ref(), config, &retry)?;
        let metadata = load_metadata(client.as_ref(), &container, config, prompt, &retry)?;
        drop(client);

        let uuid = hex::encode(Sha1::digest(container.as_str().as_bytes()));
        info!(
            "Opened device {uuid} (container {}): {} blocks of {} bytes",
            config.container_name, metadata.block_count, metadata.block_size
        );

        let queue = Arc::new(WorkQueue::new());
        let index = Arc::new(BlockIndex::new(
            container.clone(),
            metadata.block_size,
            metadata.block_count,
        ));
        let stats = Arc::new(DeviceStats::new());

        let mut clients: Vec<Box<dyn RemoteStoreClient>> = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            clients.push(auth.obtain_client()?);
        }

        let shared = Arc::new(WorkerShared {
            queue: Arc::clone(&queue),
            index: Arc::clone(&index),
            block_size: metadata.block_size,
            retry,
            sleeper: Arc::new(ThreadSleeper),
            stats: Arc::clone(&stats),
        });
        let pool = WorkerPool::start(clients, shared)?;

        Ok(Self {
            container,
            metadata,
            uuid,
            queue,
            index,
            stats,
            pool: Mutex::new(Some(pool)),
            closed: AtomicBool::new(false),
        })
    }

    /// Persisted geometry
    pub const fn metadata(&self) -> &DeviceMetadata {
        &self.metadata
    }

    pub const fn block_size(&self) -> u64 {
        self.metadata.block_size
    }

    pub const fn block_count(&self) -> u64 {
        self.metadata.block_count
    }

    pub const fn total_size(&self) -> u64 {
        self.metadata.total_size()
    }

    /// Stable device identifier: hex SHA-1 of the container id
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Container backing the device
    pub const fn container(&self) -> &ContainerId {
        &self.container
    }

    /// Number of blocks known to have a backing object
    pub fn mapped_blocks(&self) -> usize {
        self.index.mapped_count()
    }

    /// Current I/O counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read a block, blocking the calling thread
    ///
    /// Must not be called from inside a tokio runtime; use
    /// [`read_async`](Self::read_async) there.
    pub fn read(&self, index: BlockNo, priority: Priority) -> BlockResult<Bytes> {
        self.read_async(index, priority)?.wait()
    }

    /// Write a block, blocking the calling thread
    ///
    /// Returns the object now backing the block.
    pub fn write(
        &self,
        index: BlockNo,
        data: impl Into<Bytes>,
        priority: Priority,
    ) -> BlockResult<ObjectId> {
        self.write_async(index, data, priority)?.wait()
    }

    /// Queue a read; `callback` runs on a worker thread once it completes
    pub fn read_with<F>(&self, index: BlockNo, priority: Priority, callback: F) -> BlockResult<()>
    where
        F: FnOnce(BlockResult<Bytes>) + Send + 'static,
    {
        self.submit(index, None, priority, CompletionSink::callback(callback))
    }

    /// Queue a write; `callback` runs on a worker thread once it completes
    pub fn write_with<F>(
        &self,
        index: BlockNo,
        data: impl Into<Bytes>,
        priority: Priority,
        callback: F,
    ) -> BlockResult<()>
    where
        F: FnOnce(BlockResult<ObjectId>) + Send + 'static,
    {
        self.submit(
            index,
            Some(data.into()),
            priority,
            CompletionSink::callback(callback),
        )
    }

    /// Queue a read and return a handle to its result
    pub fn read_async(&self, index: BlockNo, priority: Priority) -> BlockResult<IoHandle<Bytes>> {
        let (sink, handle) = CompletionSink::channel();
        self.submit(index, None, priority, sink)?;
        Ok(handle)
    }

    /// Queue a write and return a handle to its result
    pub fn write_async(
        &self,
        index: BlockNo,
        data: impl Into<Bytes>,
        priority: Priority,
    ) -> BlockResult<IoHandle<ObjectId>> {
        let (sink, handle) = CompletionSink::channel();
        self.submit(index, Some(data.into()), priority, sink)?;
        Ok(handle)
    }

    /// Block until every queued and in-flight operation has completed,
    /// including delivery of its result
    pub fn flush(&self) {
        info!("Syncing device {}", self.uuid);
        self.queue.join();
    }

    /// Shut the device down
    ///
    /// Without `force`, outstanding work is flushed and the workers are
    /// joined. With `force`, queued work fails with [`BlockError::Closed`]
    /// and in-flight operations finish in the background. Closing twice is
    /// a no-op.
    pub fn close(&self, force: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(mut pool) = self.pool.lock().take() {
            if force {
                let cancelled = pool.abort();
                if cancelled > 0 {
                    warn!("Cancelled {cancelled} queued operations on forced close");
                }
            } else {
                self.flush();
                pool.stop();
            }
        }
        info!("Closed device {}", self.uuid);
    }

    fn submit(
        &self,
        index: BlockNo,
        payload: Option<Bytes>,
        priority: Priority,
        sink: CompletionSink,
    ) -> BlockResult<()> {
        if self.is_closed() {
            return Err(BlockError::Closed);
        }
        if index >= self.metadata.block_count {
            return Err(BlockError::OutOfBounds {
                index,
                block_count: self.metadata.block_count,
            });
        }
        if let Some(data) = &payload {
            if data.len() as u64 != self.metadata.block_size {
                return Err(BlockError::InvalidLength {
                    expected: self.metadata.block_size,
                    actual: data.len() as u64,
                });
            }
        }

        let item = WorkItem {
            index,
            payload,
            sink,
        };
        self.queue
            .put(item, priority)
            .map_err(|_| BlockError::Closed)
    }
}

impl Drop for BlockDevice {
    fn drop(&mut self) {
        self.close(false);
    }
}

/// Run an open-time store call under the retry policy
fn with_retry<T>(
    retry: &RetryPolicy,
    op: impl FnMut() -> cloudbd_common::Result<T>,
) -> BlockResult<T> {
    retry
        .run(&ThreadSleeper, &mut rand::thread_rng(), |_, _| {}, op)
        .map_err(BlockError::from)
}

fn resolve_container(
    client: &dyn RemoteStoreClient,
    config: &DeviceConfig,
    retry: &RetryPolicy,
) -> BlockResult<ContainerId> {
    let name = config.container_name.as_str();
    let mut found = with_retry(retry, || client.list_containers(name))?;

    match found.len() {
        0 if config.create => {
            let id = with_retry(retry, || client.create_container(name))?;
            info!("Created container {name} ({id})");
            Ok(id)
        }
        0 => Err(BlockError::NotFound(format!("container {name}"))),
        1 => {
            let container = found.remove(0);
            if container.writable {
                Ok(container.id)
            } else {
                Err(BlockError::PermissionDenied(format!(
                    "container {name} is not writable"
                )))
            }
        }
        n => Err(BlockError::AmbiguousState(format!(
            "{n} containers named {name}"
        ))),
    }
}

fn load_metadata(
    client: &dyn RemoteStoreClient,
    container: &ContainerId,
    config: &DeviceConfig,
    prompt: &dyn GeometryPrompt,
    retry: &RetryPolicy,
) -> BlockResult<DeviceMetadata> {
    let found = with_retry(retry, || {
        client.list_objects(container, METADATA_OBJECT_NAME)
    })?;

    match found.as_slice() {
        [] if config.create => init_metadata(client, container, config, prompt, retry),
        [] => Err(BlockError::NotFound(format!(
            "metadata object {METADATA_OBJECT_NAME} in container {}",
            config.container_name
        ))),
        [object] => {
            let raw = with_retry(retry, || client.get_object(&object.id))?;
            let value: serde_json::Value = serde_json::from_slice(&raw)?;
            let version = value
                .get("version")
                .and_then(serde_json::Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0);
            if version != METADATA_VERSION {
                return Err(BlockError::VersionMismatch {
                    expected: METADATA_VERSION,
                    found: version,
                });
            }

            let metadata: DeviceMetadata = serde_json::from_value(value)?;
            if metadata.block_size == 0 || metadata.block_count == 0 {
                return Err(BlockError::Configuration(format!(
                    "persisted geometry is empty: {metadata:?}"
                )));
            }
            if config
                .default_block_size
                .is_some_and(|bs| bs != metadata.block_size)
            {
                warn!(
                    "Ignoring configured block size, device uses {} bytes",
                    metadata.block_size
                );
            }
            Ok(metadata)
        }
        many => Err(BlockError::AmbiguousState(format!(
            "{} metadata objects in container {}",
            many.len(),
            config.container_name
        ))),
    }
}

fn init_metadata(
    client: &dyn RemoteStoreClient,
    container: &ContainerId,
    config: &DeviceConfig,
    prompt: &dyn GeometryPrompt,
    retry: &RetryPolicy,
) -> BlockResult<DeviceMetadata> {
    let block_size = match config.default_block_size {
        Some(size) => size,
        None => prompt.ask("Desired block size")?,
    };
    let total_size = match config.default_total_size {
        Some(size) => size,
        None => prompt.ask("Total size")?,
    };

    let metadata = DeviceMetadata::for_new_device(block_size, total_size).ok_or_else(|| {
        BlockError::Configuration(format!(
            "block size {block_size} must be positive and not bigger than total size {total_size}"
        ))
    })?;
    if metadata.total_size() != total_size {
        info!(
            "Only using {} bytes instead of {total_size}",
            metadata.total_size()
        );
    }

    let body = Bytes::from(serde_json::to_vec(&metadata)?);
    with_retry(retry, || {
        client.create_object(container, METADATA_OBJECT_NAME, METADATA_MIME, body.clone())
    })?;
    info!(
        "Initialized device metadata: {} blocks of {} bytes",
        metadata.block_count, metadata.block_size
    );
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudbd_client::{MemoryStore, StoreOp};
    use cloudbd_common::RetryConfig;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const BS: u64 = 64;

    fn test_config(create: bool) -> DeviceConfig {
        DeviceConfig {
            create,
            workers: 4,
            default_block_size: Some(BS),
            default_total_size: Some(BS * 16),
            retry: RetryConfig {
                max_attempts: 5,
                base_delay_ms: 1,
                jitter_ms: 1,
            },
            ..DeviceConfig::new("gbd-test")
        }
    }

    fn open_new(store: &MemoryStore) -> BlockDevice {
        BlockDevice::open(&test_config(true), store).unwrap()
    }

    fn block(byte: u8) -> Bytes {
        Bytes::from(vec![byte; BS as usize])
    }

    struct FixedPrompt(u64, u64);

    impl GeometryPrompt for FixedPrompt {
        fn ask(&self, question: &str) -> BlockResult<u64> {
            Ok(if question.contains("block") { self.0 } else { self.1 })
        }
    }

    #[test]
    fn test_open_initializes_new_device() {
        let store = MemoryStore::new();
        let dev = open_new(&store);

        assert_eq!(dev.block_size(), BS);
        assert_eq!(dev.block_count(), 16);
        assert_eq!(dev.total_size(), BS * 16);
        assert_eq!(store.container_count("gbd-test"), 1);
        // One client for open plus one per worker
        assert_eq!(store.clients_issued(), 5);

        let meta_ids = store.objects_named(dev.container(), METADATA_OBJECT_NAME);
        assert_eq!(meta_ids.len(), 1);
        assert_eq!(store.object_mime(&meta_ids[0]).unwrap(), METADATA_MIME);
        let persisted: DeviceMetadata =
            serde_json::from_slice(&store.object_data(&meta_ids[0]).unwrap()).unwrap();
        assert_eq!(persisted, *dev.metadata());
    }

    #[test]
    fn test_open_truncates_total_size() {
        let store = MemoryStore::new();
        let config = DeviceConfig {
            default_total_size: Some(BS * 3 + 10),
            ..test_config(true)
        };
        let dev = BlockDevice::open(&config, &store).unwrap();
        assert_eq!(dev.block_count(), 3);
        assert_eq!(dev.total_size(), BS * 3);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let store = MemoryStore::new();
        let config = DeviceConfig {
            workers: 0,
            ..test_config(true)
        };

        let err = BlockDevice::open(&config, &store).err().unwrap();
        assert!(matches!(&err, BlockError::Configuration(msg) if msg == "workers must be at least 1"));
        assert_eq!(err.to_string().matches("onfiguration error").count(), 1);
        assert_eq!(store.clients_issued(), 0);
    }

    #[test]
    fn test_open_rejects_oversized_block() {
        let store = MemoryStore::new();
        let config = DeviceConfig {
            default_total_size: Some(BS - 1),
            ..test_config(true)
        };
        assert!(matches!(
            BlockDevice::open(&config, &store),
            Err(BlockError::Configuration(_))
        ));
    }

    #[test]
    fn test_open_prompts_for_missing_geometry() {
        let store = MemoryStore::new();
        let config = DeviceConfig {
            default_block_size: None,
            default_total_size: None,
            ..test_config(true)
        };

        assert!(matches!(
            BlockDevice::open(&config, &store),
            Err(BlockError::Configuration(_))
        ));

        let dev = BlockDevice::open_with_prompt(&config, &store, &FixedPrompt(128, 1024)).unwrap();
        assert_eq!(dev.block_size(), 128);
        assert_eq!(dev.block_count(), 8);
    }

    #[test]
    fn test_reopen_uses_persisted_geometry() {
        let store = MemoryStore::new();
        let uuid = {
            let dev = open_new(&store);
            dev.uuid().to_string()
        };

        let config = DeviceConfig {
            default_block_size: Some(4096),
            default_total_size: Some(1 << 20),
            ..test_config(false)
        };
        let dev = BlockDevice::open(&config, &store).unwrap();
        assert_eq!(dev.block_size(), BS);
        assert_eq!(dev.block_count(), 16);
        assert_eq!(dev.uuid(), uuid);
        assert_eq!(dev.uuid().len(), 40);
        assert_eq!(store.container_count("gbd-test"), 1);
    }

    #[test]
    fn test_open_missing_container_without_create() {
        let store = MemoryStore::new();
        assert!(matches!(
            BlockDevice::open(&test_config(false), &store),
            Err(BlockError::NotFound(_))
        ));
        assert_eq!(store.calls(StoreOp::CreateContainer), 0);
    }

    #[test]
    fn test_open_missing_metadata_without_create() {
        let store = MemoryStore::new();
        store.insert_container("gbd-test", true);
        assert!(matches!(
            BlockDevice::open(&test_config(false), &store),
            Err(BlockError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_duplicate_containers() {
        let store = MemoryStore::new();
        store.insert_container("gbd-test", true);
        store.insert_container("gbd-test", true);
        assert!(matches!(
            BlockDevice::open(&test_config(true), &store),
            Err(BlockError::AmbiguousState(_))
        ));
    }

    #[test]
    fn test_open_read_only_container() {
        let store = MemoryStore::new();
        store.insert_container("gbd-test", false);
        assert!(matches!(
            BlockDevice::open(&test_config(true), &store),
            Err(BlockError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_version_mismatch_starts_no_workers() {
        let store = MemoryStore::new();
        let cid = store.insert_container("gbd-test", true);
        store.insert_object(
            &cid,
            METADATA_OBJECT_NAME,
            Bytes::from_static(br#"{"version": 99, "block_size": 64, "block_count": 4}"#),
        );

        let err = BlockDevice::open(&test_config(false), &store).err().unwrap();
        assert!(matches!(
            err,
            BlockError::VersionMismatch {
                expected: METADATA_VERSION,
                found: 99
            }
        ));
        // Only the open-time client was ever issued
        assert_eq!(store.clients_issued(), 1);
    }

    #[test]
    fn test_open_retries_rate_limited_lookup() {
        let store = MemoryStore::new();
        store.rate_limit_next(StoreOp::ListContainers, 2);
        let dev = open_new(&store);
        assert_eq!(dev.block_count(), 16);
        assert_eq!(store.calls(StoreOp::ListContainers), 3);
    }

    #[test]
    fn test_read_unwritten_block_is_zero() {
        let store = MemoryStore::new();
        let dev = open_new(&store);

        for index in 0..dev.block_count() {
            assert_eq!(dev.read(index, Priority::Normal).unwrap(), block(0));
        }
        // Only the metadata object exists
        assert_eq!(store.object_count(dev.container()), 1);
        assert_eq!(store.calls(StoreOp::CreateObject), 1);
        assert_eq!(dev.stats().zero_reads, 16);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let store = MemoryStore::new();
        let dev = open_new(&store);

        let first = dev.write(5, block(0xAA), Priority::Normal).unwrap();
        assert_eq!(dev.read(5, Priority::Normal).unwrap(), block(0xAA));

        let second = dev.write(5, block(0xBB), Priority::High).unwrap();
        assert_eq!(first, second);
        assert_eq!(dev.read(5, Priority::Low).unwrap(), block(0xBB));
        assert_eq!(store.objects_named(dev.container(), "block_5"), vec![first]);
        assert_eq!(dev.mapped_blocks(), 1);
    }

    #[test]
    fn test_data_survives_reopen() {
        let store = MemoryStore::new();
        {
            let dev = open_new(&store);
            dev.write(2, block(7), Priority::Normal).unwrap();
            dev.close(false);
        }

        let dev = BlockDevice::open(&test_config(false), &store).unwrap();
        assert_eq!(dev.read(2, Priority::Normal).unwrap(), block(7));
        assert_eq!(dev.read(3, Priority::Normal).unwrap(), block(0));
    }

    #[test]
    fn test_invalid_arguments_rejected_before_store() {
        let store = MemoryStore::new();
        let dev = open_new(&store);
        let list_calls = store.calls(StoreOp::ListObjects);

        assert!(matches!(
            dev.read(16, Priority::Normal),
            Err(BlockError::OutOfBounds {
                index: 16,
                block_count: 16
            })
        ));
        assert!(matches!(
            dev.write(99, block(1), Priority::Normal),
            Err(BlockError::OutOfBounds { .. })
        ));
        assert!(matches!(
            dev.write(0, vec![1u8; BS as usize - 1], Priority::Normal),
            Err(BlockError::InvalidLength { .. })
        ));
        assert!(matches!(
            dev.write_with(0, Bytes::new(), Priority::Normal, |_| {}),
            Err(BlockError::InvalidLength { .. })
        ));

        assert_eq!(store.calls(StoreOp::ListObjects), list_calls);
        assert_eq!(store.calls(StoreOp::CreateObject), 1);
    }

    #[test]
    fn test_flush_waits_for_callbacks() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_millis(2));
        let dev = open_new(&store);
        let completed = Arc::new(AtomicUsize::new(0));

        for index in 0..dev.block_count() {
            let completed = Arc::clone(&completed);
            dev.write_with(index, block(index as u8), Priority::Normal, move |result| {
                assert!(result.is_ok());
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        dev.flush();
        assert_eq!(completed.load(Ordering::SeqCst), 16);
        assert_eq!(dev.stats().allocations, 16);
    }

    #[test]
    fn test_concurrent_writes_allocate_once() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_millis(5));
        let dev = Arc::new(open_new(&store));

        let writers: Vec<_> = (1..=8u8)
            .map(|byte| {
                let dev = Arc::clone(&dev);
                thread::spawn(move || dev.write(9, block(byte), Priority::Normal))
            })
            .collect();

        let ids: HashSet<ObjectId> = writers
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.objects_named(dev.container(), "block_9").len(), 1);

        let content = dev.read(9, Priority::Normal).unwrap();
        assert!((1..=8u8).any(|byte| content == block(byte)));
    }

    #[test]
    fn test_rate_limited_write_recovers() {
        let store = MemoryStore::new();
        let dev = open_new(&store);
        store.rate_limit_next(StoreOp::CreateObject, 4);

        dev.write(1, block(3), Priority::Normal).unwrap();
        assert_eq!(store.calls(StoreOp::CreateObject), 1 + 5);
        assert_eq!(dev.stats().retries, 4);
        assert_eq!(dev.read(1, Priority::Normal).unwrap(), block(3));
    }

    #[test]
    fn test_rate_limit_exhaustion_reaches_caller() {
        let store = MemoryStore::new();
        let dev = open_new(&store);
        dev.write(1, block(3), Priority::Normal).unwrap();
        store.rate_limit_next(StoreOp::UpdateObject, 5);

        let err = dev.write(1, block(4), Priority::Normal).unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(store.calls(StoreOp::UpdateObject), 5);
        assert_eq!(dev.stats().failures, 1);
    }

    #[test]
    fn test_ambiguous_block_surfaces_to_callback() {
        let store = MemoryStore::new();
        let dev = open_new(&store);
        store.insert_object(dev.container(), "block_4", block(1));
        store.insert_object(dev.container(), "block_4", block(2));

        let (tx, rx) = mpsc::channel();
        dev.read_with(4, Priority::Normal, move |result| {
            tx.send(result.err()).unwrap();
        })
        .unwrap();

        let err = rx.recv().unwrap().unwrap();
        assert!(matches!(err, BlockError::AmbiguousState(_)));
        assert!(matches!(
            dev.read(4, Priority::Normal),
            Err(BlockError::AmbiguousState(_))
        ));
    }

    #[test]
    fn test_size_mismatch_reaches_caller() {
        let store = MemoryStore::new();
        let dev = open_new(&store);
        let id = dev.write(0, block(1), Priority::Normal).unwrap();
        store.replace_object(&id, Bytes::from_static(b"short"));

        assert!(matches!(
            dev.read(0, Priority::Normal),
            Err(BlockError::SizeMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn test_priority_order_with_single_worker() {
        let store = MemoryStore::new();
        let config = DeviceConfig {
            workers: 1,
            ..test_config(true)
        };
        let dev = BlockDevice::open(&config, &store).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the only worker inside a callback until everything is queued
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        dev.read_with(0, Priority::Normal, move |_| {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv().unwrap();

        for (index, priority) in [
            (1, Priority::Low),
            (2, Priority::Normal),
            (3, Priority::Critical),
            (4, Priority::High),
            (5, Priority::Normal),
        ] {
            let order = Arc::clone(&order);
            dev.read_with(index, priority, move |_| order.lock().push(index))
                .unwrap();
        }

        release_tx.send(()).unwrap();
        dev.flush();
        assert_eq!(*order.lock(), vec![3, 4, 2, 5, 1]);
    }

    #[test]
    fn test_close_flushes_and_rejects() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_millis(2));
        let dev = open_new(&store);
        let completed = Arc::new(AtomicUsize::new(0));

        for index in 0..8 {
            let completed = Arc::clone(&completed);
            dev.write_with(index, block(1), Priority::Normal, move |result| {
                assert!(result.is_ok());
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        dev.close(false);
        assert_eq!(completed.load(Ordering::SeqCst), 8);
        assert!(dev.is_closed());
        assert!(matches!(dev.read(0, Priority::Normal), Err(BlockError::Closed)));
        dev.close(false);
    }

    #[test]
    fn test_force_close_cancels_queued_work() {
        let store = MemoryStore::new();
        let config = DeviceConfig {
            workers: 1,
            ..test_config(true)
        };
        let dev = BlockDevice::open(&config, &store).unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        dev.read_with(0, Priority::Normal, move |_| {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv().unwrap();

        let queued = dev.read_async(1, Priority::Normal).unwrap();
        dev.close(true);
        assert!(matches!(queued.wait(), Err(BlockError::Closed)));

        release_tx.send(()).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_handles() {
        let store = MemoryStore::new();
        let dev = open_new(&store);

        let id = dev.write_async(3, block(0x5A), Priority::High).unwrap().await.unwrap();
        let data = dev.read_async(3, Priority::Normal).unwrap().await.unwrap();
        assert_eq!(data, block(0x5A));
        assert_eq!(store.objects_named(dev.container(), "block_3"), vec![id]);

        let zero = dev.read_async(4, Priority::Low).unwrap().await.unwrap();
        assert_eq!(zero, block(0));

        tokio::task::spawn_blocking(move || dev.close(false))
            .await
            .unwrap();
    }
}
