//! Maintenance worker: page reclamation.
//!
//! The worker wakes on a timer or when the write path signals it (page
//! rotation, rotation failure, flush completion, manual trigger). A pass
//! first returns fully drained `Retiring` pages to the free pool, then —
//! when free pages are scarce or the pass was forced — picks the best
//! `Sealed` reclaim candidate by policy score and starts retiring it.
//! A page is reused only once its refcount is zero, no flush is pending,
//! and it holds no buffer; that is the safety contract of this module.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::engine::Shared;
use crate::page::{PageSnapshot, PageState};
use crate::types::PageId;

/// Scores pages for reclamation; higher wins.
///
/// Maintenance evaluates every `Sealed` page through the policy and
/// retires the highest-scored candidate. Implementations see a
/// [`PageSnapshot`] including the histogram-based live-byte estimate.
pub trait ReclaimPolicy: Send + Sync {
    /// Returns the reclaim priority of one page.
    fn score(&self, page: &PageSnapshot) -> f64;
}

/// Default policy: score by the estimated slack fraction of the page.
///
/// Live bytes are estimated from the per-write size histogram; the
/// remainder of the allocated span — partial-buffer tails and bucket
/// rounding — counts as reclaimable slack.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlackPolicy;

impl ReclaimPolicy for SlackPolicy {
    fn score(&self, page: &PageSnapshot) -> f64 {
        if page.allocated == 0 {
            return 0.0;
        }
        let live = page.estimated_live_bytes.min(u64::from(page.allocated)) as f64;
        1.0 - live / f64::from(page.allocated)
    }
}

pub(crate) struct MaintSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

#[derive(Default)]
struct SignalState {
    pending: bool,
    forced: bool,
    shutdown: bool,
}

impl MaintSignal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            cond: Condvar::new(),
        }
    }

    /// Requests a pass. A forced pass ignores the free-page low-water mark.
    pub(crate) fn notify(&self, forced: bool) {
        let mut state = self.state.lock();
        state.pending = true;
        if forced {
            state.forced = true;
        }
        self.cond.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }

    /// Blocks until signalled or until `interval` elapses. Returns `None`
    /// on shutdown, otherwise whether the pass was forced.
    fn wait(&self, interval: Duration) -> Option<bool> {
        let mut state = self.state.lock();
        while !state.pending && !state.shutdown {
            if self.cond.wait_for(&mut state, interval).timed_out() {
                break;
            }
        }
        if state.shutdown {
            return None;
        }
        let forced = state.forced;
        state.pending = false;
        state.forced = false;
        Some(forced)
    }
}

pub(crate) fn run(shared: Arc<Shared>) {
    debug!("store.maint.start");
    loop {
        let Some(forced) = shared.maint.wait(shared.config.maint_interval) else {
            debug!("store.maint.exit");
            return;
        };
        pass(&shared, forced);
    }
}

/// One maintenance pass.
pub(crate) fn pass(shared: &Shared, forced: bool) {
    collect_retired(shared);
    let free_count = shared.free_page_count();
    if !forced && free_count >= shared.config.reclaim_low_water {
        return;
    }
    if let Some(candidate) = select_candidate(shared) {
        begin_retire(shared, candidate);
        // The common case has no readers in flight; try to finish now
        // rather than waiting for the next wake-up.
        collect_retired(shared);
    } else {
        debug!(free_count, "store.maint.no_candidate");
    }
}

/// Returns every drained `Retiring` page to the free pool.
fn collect_retired(shared: &Shared) {
    let mut freed: Vec<PageId> = Vec::new();
    for page in shared.pages.iter() {
        let mut meta = page.meta.lock();
        if meta.state == PageState::Retiring
            && meta.refcount == 0
            && meta.pending_flush == 0
            && meta.wbuf.is_none()
        {
            meta.reset_for_reuse();
            freed.push(page.id());
        }
    }
    if freed.is_empty() {
        return;
    }
    {
        let mut state = shared.state.lock();
        state.free_pages.extend(freed.iter().copied());
    }
    shared.metrics.add_pages_reclaimed(freed.len() as u64);
    info!(pages = freed.len(), "store.maint.reclaimed");
}

/// Picks the highest-scored `Sealed` page, if any.
fn select_candidate(shared: &Shared) -> Option<PageId> {
    let mut best: Option<(PageId, f64)> = None;
    for page in shared.pages.iter() {
        let snap = page.snapshot();
        if snap.state != PageState::Sealed {
            continue;
        }
        let score = shared.config.reclaim_policy.score(&snap);
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((snap.id, score));
        }
    }
    best.map(|(id, score)| {
        debug!(page = %id, score, "store.maint.candidate");
        id
    })
}

/// Transitions the candidate to `Retiring` and queues any leftover buffer
/// for flush so its staged bytes still reach the file.
fn begin_retire(shared: &Shared, id: PageId) {
    let page = &shared.pages[id.0 as usize];
    let mut meta = page.meta.lock();
    if meta.state != PageState::Sealed {
        return;
    }
    meta.state = PageState::Retiring;
    if let Some(wbuf) = meta.wbuf.take() {
        if wbuf.staged() > 0 {
            meta.pending_flush += 1;
            shared.dispatch_flush(wbuf);
        } else {
            drop(meta);
            shared.release_wbuf(wbuf);
            debug!(page = %id, "store.maint.retiring");
            return;
        }
    }
    debug!(page = %id, "store.maint.retiring");
}
