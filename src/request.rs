//! I/O descriptors for the worker queues.

use crate::error::Result;
use crate::types::PageId;

/// Direction of a descriptor-based I/O operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoMode {
    /// Positioned read into the descriptor's buffer.
    Read,
    /// Positioned write of the descriptor's buffer.
    Write,
}

/// Completion closure of a descriptor.
///
/// Receives the descriptor back together with the I/O outcome (bytes
/// transferred, or the error). It fires exactly once, on a worker thread,
/// and the engine never touches the descriptor afterwards.
pub type IoCompletion = Box<dyn FnOnce(IoRequest, Result<usize>) + Send + 'static>;

/// A request to read or write raw bytes at a page-relative offset.
///
/// Positions are resolved by the caller: reads name the `(page, offset)`
/// a prior [`crate::Store::write`] returned. Requests are owned by the
/// submitting caller until the completion fires; submission moves them
/// into a worker queue as a batch.
pub struct IoRequest {
    /// Target page.
    pub page: PageId,
    /// Byte offset within the page.
    pub offset: u32,
    /// Operation direction.
    pub mode: IoMode,
    /// Caller buffer: destination for reads, source for writes. Its length
    /// is the transfer length.
    pub buf: Vec<u8>,
    completion: Option<IoCompletion>,
}

impl IoRequest {
    /// Builds a read descriptor with a zeroed destination buffer of `len`
    /// bytes.
    pub fn read(
        page: PageId,
        offset: u32,
        len: usize,
        completion: impl FnOnce(IoRequest, Result<usize>) + Send + 'static,
    ) -> Self {
        Self {
            page,
            offset,
            mode: IoMode::Read,
            buf: vec![0u8; len],
            completion: Some(Box::new(completion)),
        }
    }

    /// Builds a raw write descriptor carrying `buf` as the source bytes.
    pub fn write(
        page: PageId,
        offset: u32,
        buf: Vec<u8>,
        completion: impl FnOnce(IoRequest, Result<usize>) + Send + 'static,
    ) -> Self {
        Self {
            page,
            offset,
            mode: IoMode::Write,
            buf,
            completion: Some(Box::new(completion)),
        }
    }

    /// Consumes the descriptor, invoking its completion once.
    pub(crate) fn complete(mut self, result: Result<usize>) {
        if let Some(completion) = self.completion.take() {
            completion(self, result);
        }
    }
}

impl std::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRequest")
            .field("page", &self.page)
            .field("offset", &self.offset)
            .field("mode", &self.mode)
            .field("len", &self.buf.len())
            .finish()
    }
}
