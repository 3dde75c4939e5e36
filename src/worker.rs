//! I/O worker pool.
//!
//! Each worker owns an inbound descriptor queue and a flush queue behind
//! one mutex, plus a condvar for wake-up. Batches are drained under the
//! lock and executed after it is released; flushes are drained first
//! because completing them returns buffers to the free stack and unblocks
//! writers.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::engine::Shared;
use crate::request::IoRequest;
use crate::wbuf::WriteBuffer;

pub(crate) struct WorkerQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

struct QueueState {
    ios: VecDeque<IoRequest>,
    flushes: VecDeque<WriteBuffer>,
    shutdown: bool,
}

enum Work {
    Flushes(Vec<WriteBuffer>),
    Ios(Vec<IoRequest>),
}

impl WorkerQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ios: VecDeque::new(),
                flushes: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Appends a buffer to the flush queue and wakes the worker.
    pub(crate) fn push_flush(&self, wbuf: WriteBuffer) {
        let mut state = self.state.lock();
        state.flushes.push_back(wbuf);
        self.cond.notify_one();
    }

    /// Appends a descriptor batch in submission order and wakes the worker.
    pub(crate) fn push_ios(&self, batch: Vec<IoRequest>) {
        let mut state = self.state.lock();
        state.ios.extend(batch);
        self.cond.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }
}

/// Worker run loop: wait for work, extract one batch, execute it with no
/// queue lock held.
pub(crate) fn run(shared: Arc<Shared>, index: usize) {
    let queue = Arc::clone(&shared.workers[index]);
    let depth = shared.config.io_depth;
    debug!(worker = index, "store.worker.start");
    loop {
        let work = {
            let mut state = queue.state.lock();
            loop {
                if state.shutdown {
                    debug!(worker = index, "store.worker.exit");
                    return;
                }
                if !state.flushes.is_empty() {
                    let take = state.flushes.len().min(depth);
                    break Work::Flushes(state.flushes.drain(..take).collect());
                }
                if !state.ios.is_empty() {
                    let take = state.ios.len().min(depth);
                    break Work::Ios(state.ios.drain(..take).collect());
                }
                queue.cond.wait(&mut state);
            }
        };
        match work {
            Work::Flushes(batch) => shared.execute_flush_batch(batch),
            Work::Ios(batch) => shared.execute_io_batch(batch),
        }
    }
}
