//! Per-device I/O statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Device statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Completed read operations
    pub read_ops: u64,
    /// Completed write operations
    pub write_ops: u64,
    /// Bytes read
    pub bytes_read: u64,
    /// Bytes written
    pub bytes_written: u64,
    /// Completed flush operations
    pub flush_ops: u64,
    /// Completed trim operations
    pub trim_ops: u64,
    /// Reads that completed with an error
    pub read_errors: u64,
    /// Writes, flushes and trims that completed with an error
    pub write_errors: u64,
    /// Requests rejected before reaching the wire
    pub rejected: u64,
    /// Connection generations that reached the ready state
    pub connects: u64,
    /// Connection generations torn down
    pub disconnects: u64,
}

impl DeviceStats {
    /// Total operations that reached the server
    pub fn total_ops(&self) -> u64 {
        self.read_ops + self.write_ops + self.flush_ops + self.trim_ops
    }

    /// Total errors reported on completed requests
    pub fn total_errors(&self) -> u64 {
        self.read_errors + self.write_errors
    }
}

/// Live counters shared between a device and its sessions
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    flush_ops: AtomicU64,
    trim_ops: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    rejected: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_read(&self, bytes: u64) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flush_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_trim(&self) {
        self.trim_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            flush_ops: self.flush_ops.load(Ordering::Relaxed),
            trim_ops: self.trim_ops.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}
