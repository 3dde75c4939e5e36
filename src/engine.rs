//! Engine context and entry points.
//!
//! Lock discipline: a page lock may be held while taking the engine lock
//! or a worker-queue lock; no path takes a page lock while holding either
//! of those. Rotation briefly holds two page locks (the sealing active
//! page and the freshly popped free page); no other path holds two.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, StoreError};
use crate::io::{FileIo, StdFileIo};
use crate::maint::{self, MaintSignal, ReclaimPolicy};
use crate::metrics::{StoreMetrics, StoreMetricsSnapshot};
use crate::options::StoreOptions;
use crate::page::{Page, PageMeta, PageSnapshot, PageState};
use crate::request::{IoMode, IoRequest};
use crate::types::{PageId, RetentionClass, WriteLocation};
use crate::wbuf::WriteBuffer;
use crate::worker::{self, WorkerQueue};

/// Validated engine geometry and tunables.
pub(crate) struct Config {
    pub page_size: u32,
    pub wbuf_size: u32,
    pub io_depth: usize,
    pub maint_interval: Duration,
    pub reclaim_low_water: usize,
    pub reclaim_policy: Arc<dyn ReclaimPolicy>,
}

/// State behind the engine-wide lock: the free pools and the per-class
/// active page slots.
pub(crate) struct EngineState {
    pub(crate) free_pages: Vec<PageId>,
    pub(crate) free_wbufs: Vec<WriteBuffer>,
    pub(crate) active: [PageId; RetentionClass::COUNT],
}

/// Engine internals shared with the worker and maintenance threads.
pub(crate) struct Shared {
    pub(crate) file: Arc<dyn FileIo>,
    pub(crate) pages: Vec<Page>,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) workers: Vec<Arc<WorkerQueue>>,
    worker_cursor: AtomicUsize,
    pub(crate) maint: MaintSignal,
    pub(crate) metrics: Arc<StoreMetrics>,
    pub(crate) config: Config,
}

impl Shared {
    /// Round-robin worker selection, advanced on every dispatch.
    pub(crate) fn next_worker(&self) -> &Arc<WorkerQueue> {
        let n = self.worker_cursor.fetch_add(1, Ordering::Relaxed);
        &self.workers[n % self.workers.len()]
    }

    /// Hands a detached buffer to a worker's flush queue.
    pub(crate) fn dispatch_flush(&self, wbuf: WriteBuffer) {
        trace!(page = %wbuf.page(), bytes = wbuf.staged(), "store.flush.dispatch");
        self.next_worker().push_flush(wbuf);
    }

    /// Returns an unused buffer straight to the free stack.
    pub(crate) fn release_wbuf(&self, wbuf: WriteBuffer) {
        self.state.lock().free_wbufs.push(wbuf);
    }

    pub(crate) fn free_page_count(&self) -> usize {
        self.state.lock().free_pages.len()
    }

    /// Executes one drained flush batch: a positioned write per buffer,
    /// durability accounting under the page lock, then the whole batch of
    /// buffers back to the free stack in one engine-lock acquisition.
    pub(crate) fn execute_flush_batch(&self, batch: Vec<WriteBuffer>) {
        let mut done = Vec::with_capacity(batch.len());
        for wbuf in batch {
            let page = &self.pages[wbuf.page().0 as usize];
            let staged = wbuf.staged();
            let off = page.base() + u64::from(wbuf.page_offset());
            let result = self.file.write_at(off, wbuf.payload());
            {
                let mut meta = page.meta.lock();
                meta.pending_flush = meta.pending_flush.saturating_sub(1);
                if result.is_ok() {
                    meta.written += staged as u32;
                }
            }
            match result {
                Ok(()) => {
                    self.metrics.add_wbuf_flush(staged as u64);
                    trace!(page = %wbuf.page(), bytes = staged, "store.flush.complete");
                }
                Err(err) => {
                    self.metrics.add_io_error();
                    warn!(page = %wbuf.page(), bytes = staged, error = %err, "store.flush.failed");
                }
            }
            done.push(wbuf);
        }
        {
            let mut state = self.state.lock();
            state.free_wbufs.extend(done);
        }
        self.maint.notify(false);
    }

    /// Executes one drained descriptor batch and fires each completion.
    pub(crate) fn execute_io_batch(&self, batch: Vec<IoRequest>) {
        for mut req in batch {
            let page = &self.pages[req.page.0 as usize];
            let off = page.base() + u64::from(req.offset);
            let len = req.buf.len();
            let result = match req.mode {
                IoMode::Read => self.file.read_at(off, &mut req.buf).map(|()| len),
                IoMode::Write => self.file.write_at(off, &req.buf).map(|()| len),
            };
            match &result {
                Ok(_) => {
                    trace!(page = %req.page, offset = req.offset, len, mode = ?req.mode, "store.io.complete")
                }
                Err(err) => {
                    self.metrics.add_io_error();
                    warn!(page = %req.page, offset = req.offset, error = %err, "store.io.failed");
                }
            }
            let target = req.page;
            req.complete(result);
            self.release_page_ref(target);
        }
    }

    /// Drops the reader reference taken at submission.
    pub(crate) fn release_page_ref(&self, id: PageId) {
        let page = &self.pages[id.0 as usize];
        let mut meta = page.meta.lock();
        meta.refcount = meta.refcount.saturating_sub(1);
        let drained = meta.refcount == 0 && meta.state == PageState::Retiring;
        drop(meta);
        if drained {
            self.maint.notify(false);
        }
    }

    /// Seals the current active page and promotes a free page into the
    /// class slot. Called with the current page's lock held; when the free
    /// stack is empty the slot is left as is and the caller's write fails.
    fn rotate_active(&self, class: RetentionClass, meta: &mut PageMeta) {
        let popped = { self.state.lock().free_pages.pop() };
        match popped {
            Some(new_id) => {
                {
                    let mut fresh = self.pages[new_id.0 as usize].meta.lock();
                    fresh.state = PageState::Active;
                }
                {
                    let mut state = self.state.lock();
                    state.active[class.slot()] = new_id;
                }
                meta.state = PageState::Sealed;
                self.metrics.add_page_rotated();
                debug!(class = ?class, page = %new_id, "store.write.rotated");
                self.maint.notify(false);
            }
            None => {
                debug!(class = ?class, "store.write.rotation_stalled");
                self.maint.notify(false);
            }
        }
    }
}

/// Tiered secondary-storage engine over one backing file.
///
/// Values are staged through write-combining buffers into fixed-size
/// pages; reads and raw writes execute asynchronously on a worker pool; a
/// maintenance worker reclaims rotated pages. See [`crate::StoreOptions`]
/// for the geometry and [`crate`] docs for the protocol.
pub struct Store {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Creates (truncating) the backing file at `path` and starts the
    /// engine.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Store> {
        let file = StdFileIo::create(path.as_ref())?;
        Self::open_with_io(Arc::new(file), options)
    }

    /// Starts the engine over a caller-provided I/O backend.
    ///
    /// The file is truncated to `page_count * page_size` bytes. This is
    /// the seam tests use to inject I/O faults.
    pub fn open_with_io(file: Arc<dyn FileIo>, options: StoreOptions) -> Result<Store> {
        options.validate()?;
        file.truncate(u64::from(options.page_count) * options.page_size)?;

        let mut pages = Vec::with_capacity(options.page_count as usize);
        for i in 0..options.page_count {
            let state = if (i as usize) < RetentionClass::COUNT {
                PageState::Active
            } else {
                PageState::Free
            };
            pages.push(Page::new(
                PageId(i),
                u64::from(i) * options.page_size,
                options.wbuf_size,
                state,
            ));
        }
        // Reverse push order so the lowest free page is popped first.
        let free_pages: Vec<PageId> = (RetentionClass::COUNT as u32..options.page_count)
            .rev()
            .map(PageId)
            .collect();
        let free_wbufs: Vec<WriteBuffer> = (0..options.wbuf_count)
            .map(|_| WriteBuffer::new(options.wbuf_size as usize))
            .collect();
        let workers: Vec<Arc<WorkerQueue>> = (0..options.io_threads)
            .map(|_| Arc::new(WorkerQueue::new()))
            .collect();

        let shared = Arc::new(Shared {
            file,
            pages,
            state: Mutex::new(EngineState {
                free_pages,
                free_wbufs,
                active: [PageId(0), PageId(1)],
            }),
            workers,
            worker_cursor: AtomicUsize::new(0),
            maint: MaintSignal::new(),
            metrics: Arc::new(StoreMetrics::default()),
            config: Config {
                page_size: options.page_size as u32,
                wbuf_size: options.wbuf_size,
                io_depth: options.io_depth,
                maint_interval: options.maint_interval,
                reclaim_low_water: options.reclaim_low_water,
                reclaim_policy: Arc::clone(&options.reclaim_policy),
            },
        });

        let mut handles = Vec::with_capacity(options.io_threads + 1);
        for index in 0..options.io_threads {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || worker::run(shared, index)));
        }
        {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || maint::run(shared)));
        }
        info!(
            page_size = options.page_size,
            page_count = options.page_count,
            wbuf_size = options.wbuf_size,
            wbuf_count = options.wbuf_count,
            workers = options.io_threads,
            "store.open"
        );
        Ok(Store { shared, handles })
    }

    /// Stages `data` into the active page of `class` and returns where the
    /// bytes will live.
    ///
    /// Success means the bytes are combined into an in-memory buffer; they
    /// reach the backing file when a worker flushes that buffer. A request
    /// must be shorter than the write-buffer capacity. Transient failures
    /// ([`StoreError::PageInactive`], [`StoreError::PageFull`],
    /// [`StoreError::NoWriteBuffer`], [`StoreError::BufferFull`]) are
    /// retryable; the engine itself never retries, and a write that finds
    /// its page full rotates the slot but still fails, so the retry lands
    /// on the fresh page.
    pub fn write(&self, class: RetentionClass, data: &[u8]) -> Result<WriteLocation> {
        let result = self.write_inner(class, data);
        if let Err(err) = &result {
            self.shared.metrics.add_write_rejected();
            trace!(class = ?class, len = data.len(), error = %err, "store.write.rejected");
        }
        result
    }

    fn write_inner(&self, class: RetentionClass, data: &[u8]) -> Result<WriteLocation> {
        let shared = &*self.shared;
        let len = data.len();
        let capacity = shared.config.wbuf_size as usize;
        if len >= capacity {
            return Err(StoreError::WriteTooLarge { len, capacity });
        }

        let id = { shared.state.lock().active[class.slot()] };
        let page = &shared.pages[id.0 as usize];
        let mut meta = page.meta.lock();
        if meta.state != PageState::Active {
            return Err(StoreError::PageInactive);
        }

        // A buffer that cannot fit the request goes to a flush queue; if
        // that leaves the page at capacity, rotate the class slot.
        if meta.wbuf.as_ref().map_or(false, |w| w.free() < len) {
            if let Some(wbuf) = meta.wbuf.take() {
                meta.pending_flush += 1;
                shared.dispatch_flush(wbuf);
            }
            if meta.allocated >= shared.config.page_size {
                shared.rotate_active(class, &mut meta);
            }
        }

        // Claim a fresh buffer for the next whole-buffer span.
        if meta.wbuf.is_none() {
            if meta.allocated >= shared.config.page_size {
                return Err(StoreError::PageFull);
            }
            let fresh = { shared.state.lock().free_wbufs.pop() };
            let Some(mut wbuf) = fresh else {
                return Err(StoreError::NoWriteBuffer);
            };
            wbuf.attach(id, meta.allocated);
            meta.allocated += shared.config.wbuf_size;
            meta.wbuf = Some(wbuf);
        }

        let Some(wbuf) = meta.wbuf.as_mut() else {
            return Err(StoreError::NoWriteBuffer);
        };
        if wbuf.free() <= len {
            return Err(StoreError::BufferFull(len));
        }
        let offset = wbuf.push(data);
        meta.obj_count += 1;
        meta.cas += 1;
        meta.histogram.record(len as u32);
        drop(meta);

        shared.metrics.add_object_written(len as u64);
        trace!(page = %id, offset, len, "store.write");
        Ok(WriteLocation { page: id, offset })
    }

    /// Queues the active page's buffer for flush if it holds staged bytes.
    ///
    /// Returns whether a buffer was handed to a worker. The unfilled tail
    /// of a flushed buffer's span is not reused; the next write claims a
    /// fresh span.
    pub fn flush(&self, class: RetentionClass) -> Result<bool> {
        let shared = &*self.shared;
        let id = { shared.state.lock().active[class.slot()] };
        let page = &shared.pages[id.0 as usize];
        let mut meta = page.meta.lock();
        if meta.state != PageState::Active {
            return Err(StoreError::PageInactive);
        }
        if meta.wbuf.as_ref().map_or(false, |w| w.staged() > 0) {
            if let Some(wbuf) = meta.wbuf.take() {
                meta.pending_flush += 1;
                shared.dispatch_flush(wbuf);
            }
            debug!(class = ?class, page = %id, "store.flush.queued");
            return Ok(true);
        }
        Ok(false)
    }

    /// Submits one read descriptor. Completion is asynchronous via the
    /// descriptor's closure.
    pub fn read(&self, request: IoRequest) -> Result<()> {
        self.submit(vec![request])
    }

    /// Submits a descriptor batch to one worker, preserving order within
    /// the batch.
    ///
    /// Validation failures reject the whole batch before anything is
    /// queued. Submission never blocks on queue depth; the queues are
    /// unbounded. Every target page holds a reader reference until its
    /// completion returns, which is what keeps maintenance from reusing a
    /// page under an in-flight read.
    pub fn submit(&self, batch: Vec<IoRequest>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let shared = &*self.shared;
        for req in &batch {
            if shared.pages.get(req.page.0 as usize).is_none() {
                return Err(StoreError::UnknownPage(req.page.0));
            }
            let end = u64::from(req.offset) + req.buf.len() as u64;
            if end > u64::from(shared.config.page_size) {
                return Err(StoreError::OutOfBounds);
            }
        }
        let mut acquired: Vec<PageId> = Vec::with_capacity(batch.len());
        for req in &batch {
            let page = &shared.pages[req.page.0 as usize];
            let mut meta = page.meta.lock();
            if meta.state == PageState::Free {
                drop(meta);
                for id in acquired {
                    shared.release_page_ref(id);
                }
                return Err(StoreError::PageInactive);
            }
            meta.refcount += 1;
            acquired.push(req.page);
        }
        shared.metrics.add_ios_submitted(batch.len() as u64);
        trace!(count = batch.len(), "store.submit");
        shared.next_worker().push_ios(batch);
        Ok(())
    }

    /// Forces a maintenance pass regardless of the free-page low-water
    /// mark.
    pub fn trigger_maintenance(&self) {
        self.shared.maint.notify(true);
    }

    /// Returns a handle to the engine metrics.
    pub fn metrics(&self) -> Arc<StoreMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Returns a snapshot of current engine metrics.
    pub fn metrics_snapshot(&self) -> StoreMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Returns a point-in-time copy of one page's bookkeeping.
    pub fn page_snapshot(&self, id: PageId) -> Option<PageSnapshot> {
        self.shared.pages.get(id.0 as usize).map(Page::snapshot)
    }

    /// Returns the number of pages currently on the free stack.
    pub fn free_pages(&self) -> usize {
        self.shared.free_page_count()
    }

    /// Returns the active page of a retention class.
    pub fn active_page(&self, class: RetentionClass) -> PageId {
        self.shared.state.lock().active[class.slot()]
    }
}

impl Drop for Store {
    /// Signals the worker and maintenance threads and joins them. Queued
    /// descriptors that never ran are dropped; their completions do not
    /// fire.
    fn drop(&mut self) {
        for queue in &self.shared.workers {
            queue.shutdown();
        }
        self.shared.maint.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!("store.close");
    }
}
