//! I/O workers
//!
//! A [`WorkerPool`] runs a fixed number of OS threads that share one
//! [`WorkQueue`]. Each [`Worker`] owns its own remote-store client, so no
//! client is ever used from two threads.
//!
//! Per item the worker executes the block operation, delivers the outcome
//! to the item's sink, and acknowledges the item to the queue. The
//! acknowledgement runs from a drop guard, so a panicking operation or
//! callback can neither kill the loop nor leave `flush` waiting forever.

use crate::completion::{CompletionSink, IoOutcome};
use crate::error::{BlockError, BlockResult};
use crate::index::BlockIndex;
use crate::queue::WorkQueue;
use crate::retry::{RetryPolicy, Sleeper, Throttling};
use crate::stats::DeviceStats;

use bytes::Bytes;
use cloudbd_client::RemoteStoreClient;
use cloudbd_common::{BlockNo, ObjectId};
use rand::Rng;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// A queued block request
#[derive(Debug)]
pub struct WorkItem {
    /// Block number
    pub index: BlockNo,
    /// Data to write, or `None` for a read
    pub payload: Option<Bytes>,
    /// Where the outcome goes
    pub sink: CompletionSink,
}

impl WorkItem {
    pub fn read(index: BlockNo, sink: CompletionSink) -> Self {
        Self {
            index,
            payload: None,
            sink,
        }
    }

    pub fn write(index: BlockNo, data: Bytes, sink: CompletionSink) -> Self {
        Self {
            index,
            payload: Some(data),
            sink,
        }
    }
}

/// State shared by every worker of one device
pub struct WorkerShared {
    pub queue: Arc<WorkQueue<WorkItem>>,
    pub index: Arc<BlockIndex>,
    pub block_size: u64,
    pub retry: RetryPolicy,
    pub sleeper: Arc<dyn Sleeper>,
    pub stats: Arc<DeviceStats>,
}

/// Acknowledges one dequeued item when dropped
struct TaskGuard<'a>(&'a WorkQueue<WorkItem>);

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.0.task_done();
    }
}

/// One I/O loop bound to a private store client
pub struct Worker {
    id: usize,
    client: Box<dyn RemoteStoreClient>,
    shared: Arc<WorkerShared>,
}

impl Worker {
    pub fn new(id: usize, client: Box<dyn RemoteStoreClient>, shared: Arc<WorkerShared>) -> Self {
        Self { id, client, shared }
    }

    /// Process items until the queue shuts down and drains
    pub fn run(self) {
        debug!("Worker {} started", self.id);
        let mut rng = rand::thread_rng();

        while let Some(item) = self.shared.queue.get() {
            let _done = TaskGuard(&self.shared.queue);
            self.process(item, &mut rng);
        }

        debug!("Worker {} stopped", self.id);
    }

    fn process<R: Rng>(&self, item: WorkItem, rng: &mut R) {
        let WorkItem {
            index,
            payload,
            sink,
        } = item;

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(index, payload, rng)))
            .unwrap_or_else(|_| {
                Err(BlockError::Internal(format!(
                    "worker {} panicked on block {index}",
                    self.id
                )))
            });

        if let Err(e) = &result {
            error!("I/O failed on block {index}: {e}");
            self.shared.stats.record_failure();
        }

        if panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(result))).is_err() {
            error!("Completion callback for block {index} panicked");
        }
    }

    /// Run one block operation against the remote store
    pub fn execute<R: Rng>(
        &self,
        index: BlockNo,
        payload: Option<Bytes>,
        rng: &mut R,
    ) -> BlockResult<IoOutcome> {
        match payload {
            None => self.read_block(index, rng).map(IoOutcome::Read),
            Some(data) => self.write_block(index, data, rng).map(IoOutcome::Written),
        }
    }

    fn read_block<R: Rng>(&self, index: BlockNo, rng: &mut R) -> BlockResult<Bytes> {
        let block_size = self.shared.block_size;
        let client = self.client.as_ref();

        let Some(id) = self.shared.index.resolve(client, index)? else {
            self.shared.stats.record_zero_read(block_size);
            return Ok(Bytes::from(vec![0u8; block_size as usize]));
        };

        let data = self.with_retry(rng, || client.get_object(&id))?;
        if data.len() as u64 != block_size {
            return Err(BlockError::SizeMismatch {
                index,
                expected: block_size,
                actual: data.len() as u64,
            });
        }

        self.shared.stats.record_read(block_size);
        Ok(data)
    }

    fn write_block<R: Rng>(&self, index: BlockNo, data: Bytes, rng: &mut R) -> BlockResult<ObjectId> {
        let block_size = self.shared.block_size;
        if data.len() as u64 != block_size {
            return Err(BlockError::InvalidLength {
                expected: block_size,
                actual: data.len() as u64,
            });
        }

        let client = self.client.as_ref();
        let blocks = &self.shared.index;

        if let Some(id) = blocks.resolve(client, index)? {
            return self.update_block(&id, data, rng).map(|()| id);
        }

        match self.with_retry(rng, || blocks.allocate(client, index, Some(data.clone()))) {
            Ok(id) => {
                self.shared.stats.record_allocation(block_size);
                Ok(id)
            }
            Err(BlockError::AlreadyMapped(_)) => {
                // Another worker allocated between our resolve and allocate
                debug!("Block {index} was allocated concurrently, updating instead");
                let id = blocks.resolve(client, index)?.ok_or_else(|| {
                    BlockError::Internal(format!("block {index} mapped but not resolvable"))
                })?;
                self.update_block(&id, data, rng).map(|()| id)
            }
            Err(e) => Err(e),
        }
    }

    fn update_block<R: Rng>(&self, id: &ObjectId, data: Bytes, rng: &mut R) -> BlockResult<()> {
        let client = self.client.as_ref();
        self.with_retry(rng, || client.update_object(id, data.clone()))?;
        self.shared.stats.record_update(self.shared.block_size);
        Ok(())
    }

    fn with_retry<T, E, R, F>(&self, rng: &mut R, op: F) -> BlockResult<T>
    where
        E: Throttling + std::fmt::Display,
        BlockError: From<E>,
        R: Rng,
        F: FnMut() -> Result<T, E>,
    {
        let stats = &self.shared.stats;
        self.shared
            .retry
            .run(
                self.shared.sleeper.as_ref(),
                rng,
                |_, _| stats.record_retry(),
                op,
            )
            .map_err(BlockError::from)
    }
}

/// Fixed-size set of worker threads sharing one queue
pub struct WorkerPool {
    queue: Arc<WorkQueue<WorkItem>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn one thread per client
    pub fn start(
        clients: Vec<Box<dyn RemoteStoreClient>>,
        shared: Arc<WorkerShared>,
    ) -> BlockResult<Self> {
        let queue = Arc::clone(&shared.queue);
        let mut pool = Self {
            queue,
            handles: Vec::with_capacity(clients.len()),
        };

        for (id, client) in clients.into_iter().enumerate() {
            let worker = Worker::new(id, client, Arc::clone(&shared));
            let handle = thread::Builder::new()
                .name(format!("cloudbd-worker-{id}"))
                .spawn(move || worker.run())
                .map_err(|e| {
                    BlockError::Internal(format!("failed to spawn worker {id}: {e}"))
                });

            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.stop();
                    return Err(e);
                }
            }
        }

        info!("Started {} I/O workers", pool.handles.len());
        Ok(pool)
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Let workers finish every queued item, then join them
    pub fn stop(&mut self) {
        self.queue.shutdown();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread exited with a panic");
            }
        }
    }

    /// Fail every queued item with [`BlockError::Closed`] and detach the workers
    ///
    /// Items already being executed still complete in the background.
    pub fn abort(&mut self) -> usize {
        let pending = self.queue.shutdown_now();
        let cancelled = pending.len();
        for item in pending {
            let _done = TaskGuard(&self.queue);
            if panic::catch_unwind(AssertUnwindSafe(|| item.sink.deliver(Err(BlockError::Closed))))
                .is_err()
            {
                error!("Completion callback for block {} panicked", item.index);
            }
        }
        self.handles.clear();
        cancelled
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop();
        }
    }
}
