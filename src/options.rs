//! Engine configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::maint::{ReclaimPolicy, SlackPolicy};

/// Configuration for [`crate::Store::open`].
///
/// Geometry is validated at open; a bad configuration fails construction
/// and no partial engine is returned.
#[derive(Clone)]
pub struct StoreOptions {
    /// Size of each page in bytes. Must be a multiple of `wbuf_size` and
    /// below the 4 GiB addressable-unit limit.
    pub page_size: u64,
    /// Number of pages in the backing file. At least two: one active page
    /// per retention class.
    pub page_count: u32,
    /// Capacity of each write-combining buffer in bytes. A single write is
    /// capped at one byte less than this.
    pub wbuf_size: u32,
    /// Number of pre-allocated write buffers shared across all pages.
    pub wbuf_count: u32,
    /// Number of I/O worker threads.
    pub io_threads: usize,
    /// Maximum queue entries a worker drains per wake-up.
    pub io_depth: usize,
    /// Timer interval of the maintenance worker.
    pub maint_interval: Duration,
    /// Free-page count below which maintenance starts reclaiming.
    pub reclaim_low_water: usize,
    /// Scoring policy used to pick reclaim candidates.
    pub reclaim_policy: Arc<dyn ReclaimPolicy>,
}

impl Default for StoreOptions {
    /// Creates default options with the engine's baseline geometry.
    fn default() -> Self {
        Self {
            page_size: 4 * 1024 * 1024,
            page_count: 64,
            wbuf_size: 256 * 1024,
            wbuf_count: 4,
            io_threads: 2,
            io_depth: 1,
            maint_interval: Duration::from_secs(1),
            reclaim_low_water: 1,
            reclaim_policy: Arc::new(SlackPolicy),
        }
    }
}

impl StoreOptions {
    /// Checks the geometry and worker parameters.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(StoreError::Invalid("page size must be nonzero"));
        }
        if self.page_size > u64::from(u32::MAX) {
            return Err(StoreError::Invalid(
                "page size exceeds the 4 GiB addressable unit limit",
            ));
        }
        if self.page_count < 2 {
            return Err(StoreError::Invalid(
                "page count must cover both retention classes",
            ));
        }
        if self.wbuf_size == 0 {
            return Err(StoreError::Invalid("write buffer size must be nonzero"));
        }
        if u64::from(self.wbuf_size) > self.page_size {
            return Err(StoreError::Invalid(
                "write buffer size exceeds the page size",
            ));
        }
        if self.page_size % u64::from(self.wbuf_size) != 0 {
            return Err(StoreError::Invalid(
                "page size must be a multiple of the write buffer size",
            ));
        }
        if self.wbuf_count == 0 {
            return Err(StoreError::Invalid("write buffer count must be nonzero"));
        }
        if self.io_threads == 0 {
            return Err(StoreError::Invalid("worker thread count must be nonzero"));
        }
        if self.io_depth == 0 {
            return Err(StoreError::Invalid("I/O batch depth must be nonzero"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count)
            .field("wbuf_size", &self.wbuf_size)
            .field("wbuf_count", &self.wbuf_count)
            .field("io_threads", &self.io_threads)
            .field("io_depth", &self.io_depth)
            .field("maint_interval", &self.maint_interval)
            .field("reclaim_low_water", &self.reclaim_low_water)
            .finish()
    }
}
