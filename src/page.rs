//! Page arena entries and their bookkeeping.

use parking_lot::Mutex;

use crate::types::PageId;
use crate::wbuf::WriteBuffer;

/// Number of buckets in the per-page write-size histogram.
pub(crate) const HISTOGRAM_BUCKETS: usize = 61;

/// Lifecycle state of a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// On the free-page stack; holds no live data.
    Free,
    /// One of the per-class active slots; accepts staged writes.
    Active,
    /// Rotated out of its active slot; readable, never written again.
    Sealed,
    /// Selected for reclamation; draining readers and pending flushes.
    Retiring,
}

/// Histogram of per-write sizes, used to estimate how much of a page's
/// allocated span holds live bytes.
pub(crate) struct SizeHistogram {
    bucket_width: u32,
    buckets: [u64; HISTOGRAM_BUCKETS],
}

impl SizeHistogram {
    pub(crate) fn new(wbuf_size: u32) -> Self {
        Self {
            bucket_width: (wbuf_size / (HISTOGRAM_BUCKETS as u32 - 1)).max(1),
            buckets: [0; HISTOGRAM_BUCKETS],
        }
    }

    pub(crate) fn record(&mut self, len: u32) {
        let idx = ((len / self.bucket_width) as usize).min(HISTOGRAM_BUCKETS - 1);
        self.buckets[idx] += 1;
    }

    /// Sum of bucket counts times bucket midpoints. An estimate, not an
    /// exact byte count: the histogram only keeps bucketed sizes.
    pub(crate) fn estimated_bytes(&self) -> u64 {
        let width = u64::from(self.bucket_width);
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, count)| count * (i as u64 * width + width / 2))
            .sum()
    }

    pub(crate) fn reset(&mut self) {
        self.buckets = [0; HISTOGRAM_BUCKETS];
    }
}

/// Mutable page bookkeeping, guarded by the page mutex.
pub(crate) struct PageMeta {
    pub state: PageState,
    /// Modification stamp; bumped on every accepted write and on reclaim.
    pub cas: u64,
    pub obj_count: u64,
    /// Bytes of the page already claimed by write buffers. Monotonic per
    /// lifecycle, capped at the page size, advanced in whole-buffer steps.
    pub allocated: u32,
    /// Bytes confirmed flushed to the backing file.
    pub written: u32,
    /// Outstanding reader references.
    pub refcount: u32,
    /// Buffers handed to a flush queue and not yet completed.
    pub pending_flush: u32,
    pub wbuf: Option<WriteBuffer>,
    pub histogram: SizeHistogram,
}

impl PageMeta {
    /// Clears the per-lifecycle counters when the page returns to the free
    /// pool. The stamp keeps increasing across reuses.
    pub(crate) fn reset_for_reuse(&mut self) {
        self.state = PageState::Free;
        self.cas += 1;
        self.obj_count = 0;
        self.allocated = 0;
        self.written = 0;
        self.histogram.reset();
    }
}

/// One entry of the fixed page arena.
pub(crate) struct Page {
    id: PageId,
    /// Byte offset of this page's region within the backing file.
    base: u64,
    pub(crate) meta: Mutex<PageMeta>,
}

impl Page {
    pub(crate) fn new(id: PageId, base: u64, wbuf_size: u32, state: PageState) -> Self {
        Self {
            id,
            base,
            meta: Mutex::new(PageMeta {
                state,
                cas: 0,
                obj_count: 0,
                allocated: 0,
                written: 0,
                refcount: 0,
                pending_flush: 0,
                wbuf: None,
                histogram: SizeHistogram::new(wbuf_size),
            }),
        }
    }

    pub(crate) fn id(&self) -> PageId {
        self.id
    }

    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    pub(crate) fn snapshot(&self) -> PageSnapshot {
        let meta = self.meta.lock();
        PageSnapshot {
            id: self.id,
            state: meta.state,
            cas: meta.cas,
            obj_count: meta.obj_count,
            allocated: meta.allocated,
            written: meta.written,
            refcount: meta.refcount,
            has_write_buffer: meta.wbuf.is_some(),
            estimated_live_bytes: meta.histogram.estimated_bytes(),
        }
    }
}

/// Point-in-time copy of one page's bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct PageSnapshot {
    /// Page identity.
    pub id: PageId,
    /// Lifecycle state at snapshot time.
    pub state: PageState,
    /// Modification stamp.
    pub cas: u64,
    /// Number of values staged into the page this lifecycle.
    pub obj_count: u64,
    /// Bytes claimed by write buffers.
    pub allocated: u32,
    /// Bytes confirmed flushed.
    pub written: u32,
    /// Outstanding reader references.
    pub refcount: u32,
    /// Whether a write buffer is currently attached.
    pub has_write_buffer: bool,
    /// Histogram-based estimate of live bytes in the allocated span.
    pub estimated_live_bytes: u64,
}
