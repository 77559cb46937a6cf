//! Completion delivery for queued block I/O
//!
//! Every work item carries a [`CompletionSink`] that receives the outcome
//! exactly once. A sink is either a caller callback or the sending half of
//! a oneshot channel whose receiving half is an [`IoHandle`]. The handle is
//! both the synchronous bridge ([`IoHandle::wait`]) and a future.

use crate::error::{BlockError, BlockResult};

use bytes::Bytes;
use cloudbd_common::ObjectId;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

/// Result of one block operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOutcome {
    /// Block content
    Read(Bytes),
    /// Object now backing the written block
    Written(ObjectId),
}

/// Typed view of an [`IoOutcome`]
pub trait FromOutcome: Sized {
    fn from_outcome(outcome: IoOutcome) -> BlockResult<Self>;
}

impl FromOutcome for Bytes {
    fn from_outcome(outcome: IoOutcome) -> BlockResult<Self> {
        match outcome {
            IoOutcome::Read(data) => Ok(data),
            IoOutcome::Written(_) => Err(BlockError::Internal(
                "write outcome delivered to a read".to_string(),
            )),
        }
    }
}

impl FromOutcome for ObjectId {
    fn from_outcome(outcome: IoOutcome) -> BlockResult<Self> {
        match outcome {
            IoOutcome::Written(id) => Ok(id),
            IoOutcome::Read(_) => Err(BlockError::Internal(
                "read outcome delivered to a write".to_string(),
            )),
        }
    }
}

/// Caller-supplied completion callback
pub type Callback = Box<dyn FnOnce(BlockResult<IoOutcome>) + Send + 'static>;

/// Destination of a work item's outcome
pub enum CompletionSink {
    Callback(Callback),
    Channel(oneshot::Sender<BlockResult<IoOutcome>>),
}

impl CompletionSink {
    /// Wrap a typed callback
    pub fn callback<T, F>(f: F) -> Self
    where
        T: FromOutcome,
        F: FnOnce(BlockResult<T>) + Send + 'static,
    {
        Self::Callback(Box::new(move |result| {
            f(result.and_then(T::from_outcome));
        }))
    }

    /// Create a oneshot sink and the handle that receives from it
    pub fn channel<T: FromOutcome>() -> (Self, IoHandle<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Channel(tx),
            IoHandle {
                rx,
                _marker: PhantomData,
            },
        )
    }

    /// Hand the outcome over; consumes the sink
    pub fn deliver(self, result: BlockResult<IoOutcome>) {
        match self {
            Self::Callback(f) => f(result),
            Self::Channel(tx) => {
                if tx.send(result).is_err() {
                    debug!("Completion receiver dropped before delivery");
                }
            }
        }
    }
}

impl std::fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("CompletionSink::Callback"),
            Self::Channel(_) => f.write_str("CompletionSink::Channel"),
        }
    }
}

/// Pending result of one queued operation
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain
/// thread. `wait` must not be called from within a tokio runtime.
#[derive(Debug)]
pub struct IoHandle<T> {
    rx: oneshot::Receiver<BlockResult<IoOutcome>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromOutcome> IoHandle<T> {
    /// Block the calling thread until the operation completes
    pub fn wait(self) -> BlockResult<T> {
        Self::finish(self.rx.blocking_recv())
    }

    fn finish(received: Result<BlockResult<IoOutcome>, oneshot::error::RecvError>) -> BlockResult<T> {
        match received {
            Ok(result) => result.and_then(T::from_outcome),
            Err(_) => Err(BlockError::Internal(
                "operation dropped without completion".to_string(),
            )),
        }
    }
}

impl<T: FromOutcome> Future for IoHandle<T> {
    type Output = BlockResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Self::finish)
    }
}
