//! Engine operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics tracking for the staged write path, worker I/O, and reclaim.
#[derive(Default)]
pub struct StoreMetrics {
    objects_written: AtomicU64,
    bytes_staged: AtomicU64,
    writes_rejected: AtomicU64,
    wbuf_flushes: AtomicU64,
    bytes_flushed: AtomicU64,
    ios_submitted: AtomicU64,
    io_errors: AtomicU64,
    pages_rotated: AtomicU64,
    pages_reclaimed: AtomicU64,
}

/// Snapshot of engine metrics at a point in time.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreMetricsSnapshot {
    /// Values accepted by the combining write path.
    pub objects_written: u64,
    /// Bytes copied into write buffers.
    pub bytes_staged: u64,
    /// Write attempts that returned a transient failure.
    pub writes_rejected: u64,
    /// Write buffers flushed by workers.
    pub wbuf_flushes: u64,
    /// Bytes confirmed written to the backing file by buffer flushes.
    pub bytes_flushed: u64,
    /// Descriptors handed to worker queues.
    pub ios_submitted: u64,
    /// Positioned I/O calls that failed.
    pub io_errors: u64,
    /// Active-slot rotations onto a fresh page.
    pub pages_rotated: u64,
    /// Pages returned to the free pool by maintenance.
    pub pages_reclaimed: u64,
}

impl StoreMetricsSnapshot {
    /// Bytes accepted by `write` but not yet confirmed flushed.
    pub fn bytes_in_flight(&self) -> i64 {
        self.bytes_staged as i64 - self.bytes_flushed as i64
    }
}

impl StoreMetrics {
    /// Returns the number of values accepted by the write path.
    pub fn objects_written(&self) -> u64 {
        self.objects_written.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes copied into write buffers.
    pub fn bytes_staged(&self) -> u64 {
        self.bytes_staged.load(Ordering::Relaxed)
    }

    /// Returns the number of write attempts that failed transiently.
    pub fn writes_rejected(&self) -> u64 {
        self.writes_rejected.load(Ordering::Relaxed)
    }

    /// Returns the number of write buffers flushed.
    pub fn wbuf_flushes(&self) -> u64 {
        self.wbuf_flushes.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes confirmed flushed.
    pub fn bytes_flushed(&self) -> u64 {
        self.bytes_flushed.load(Ordering::Relaxed)
    }

    /// Returns the number of descriptors submitted to workers.
    pub fn ios_submitted(&self) -> u64 {
        self.ios_submitted.load(Ordering::Relaxed)
    }

    /// Returns the number of failed positioned I/O calls.
    pub fn io_errors(&self) -> u64 {
        self.io_errors.load(Ordering::Relaxed)
    }

    /// Returns the number of active-slot rotations.
    pub fn pages_rotated(&self) -> u64 {
        self.pages_rotated.load(Ordering::Relaxed)
    }

    /// Returns the number of pages reclaimed by maintenance.
    pub fn pages_reclaimed(&self) -> u64 {
        self.pages_reclaimed.load(Ordering::Relaxed)
    }

    /// Creates a snapshot of the current metrics.
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            objects_written: self.objects_written(),
            bytes_staged: self.bytes_staged(),
            writes_rejected: self.writes_rejected(),
            wbuf_flushes: self.wbuf_flushes(),
            bytes_flushed: self.bytes_flushed(),
            ios_submitted: self.ios_submitted(),
            io_errors: self.io_errors(),
            pages_rotated: self.pages_rotated(),
            pages_reclaimed: self.pages_reclaimed(),
        }
    }

    pub(crate) fn add_object_written(&self, len: u64) {
        self.objects_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_staged.fetch_add(len, Ordering::Relaxed);
    }

    pub(crate) fn add_write_rejected(&self) {
        self.writes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_wbuf_flush(&self, len: u64) {
        self.wbuf_flushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_flushed.fetch_add(len, Ordering::Relaxed);
    }

    pub(crate) fn add_ios_submitted(&self, count: u64) {
        if count != 0 {
            self.ios_submitted.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_page_rotated(&self) {
        self.pages_rotated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_pages_reclaimed(&self, count: u64) {
        if count != 0 {
            self.pages_reclaimed.fetch_add(count, Ordering::Relaxed);
        }
    }
}
