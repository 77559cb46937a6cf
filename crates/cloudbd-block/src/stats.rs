//! Device I/O counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Live I/O statistics for one device
#[derive(Debug, Default)]
pub struct DeviceStats {
    /// Reads served from a backing object
    reads: AtomicU64,
    /// Reads of unmapped blocks, served as zeros
    zero_reads: AtomicU64,
    /// Writes that completed
    writes: AtomicU64,
    /// Writes that created a backing object
    allocations: AtomicU64,
    /// Writes that replaced an existing object's content
    updates: AtomicU64,
    /// Backoffs taken after a rate-limit rejection
    retries: AtomicU64,
    /// Operations that delivered an error
    failures: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time copy of [`DeviceStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub zero_reads: u64,
    pub writes: u64,
    pub allocations: u64,
    pub updates: u64,
    pub retries: u64,
    pub failures: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_zero_read(&self, bytes: u64) {
        self.zero_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_allocation(&self, bytes: u64) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.record_write(bytes);
    }

    pub fn record_update(&self, bytes: u64) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.record_write(bytes);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            zero_reads: self.zero_reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}
