//! Engine error taxonomy.

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the storage engine.
///
/// Construction failures (`Invalid`, `Io`) are fatal: no partial engine is
/// returned. The write-path variants are transient capacity conditions the
/// caller may retry after backing off; the engine performs no internal
/// retry. I/O failures inside workers reach descriptor completions as an
/// `Io` value and never terminate the engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying positioned I/O or file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Rejected configuration at engine construction.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    /// The targeted page no longer accepts writes or reads.
    #[error("page is not active")]
    PageInactive,
    /// The active page's allocation offset reached page capacity.
    #[error("page is at capacity")]
    PageFull,
    /// The free write-buffer stack was empty.
    #[error("no free write buffer available")]
    NoWriteBuffer,
    /// The attached write buffer cannot accept the request.
    #[error("write buffer cannot accept {0} more bytes")]
    BufferFull(usize),
    /// The request can never fit a write buffer.
    #[error("request of {len} bytes reaches write buffer capacity {capacity}")]
    WriteTooLarge {
        /// Requested length in bytes.
        len: usize,
        /// Write buffer capacity in bytes.
        capacity: usize,
    },
    /// The request named a page id outside the page table.
    #[error("unknown page id {0}")]
    UnknownPage(u32),
    /// The request spans past the end of its page.
    #[error("request spans past the end of the page")]
    OutOfBounds,
}
