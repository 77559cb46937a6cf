//! cloudbd Block - Block device over a remote object store
//!
//! This crate turns a container of objects into a fixed-size block device:
//! - Block `n` is stored as the object named `block_n`; blocks that were
//!   never written have no object and read as zeros
//! - A prioritized work queue feeds a pool of worker threads, each with its
//!   own store client
//! - Rate-limited store calls are retried with exponential backoff
//! - Results are delivered through callbacks, futures or a blocking bridge

pub mod completion;
pub mod device;
pub mod error;
pub mod index;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod worker;

// Re-exports
pub use completion::{IoHandle, IoOutcome};
pub use device::{BlockDevice, GeometryPrompt, NoPrompt};
pub use error::{BlockError, BlockResult};
pub use index::{BlockIndex, Slot};
pub use queue::WorkQueue;
pub use retry::{RetryPolicy, Sleeper, ThreadSleeper, Throttling};
pub use stats::{DeviceStats, StatsSnapshot};
pub use worker::{Worker, WorkerPool};
