//! Pull-based byte streams.
//!
//! A `ReadableStream` is a lazy, finite-or-infinite sequence of bytes. Unlike an
//! iterator it distinguishes "no bytes yet" (`pull` returns `Ok(0)`) from "no bytes
//! ever again" (`reached_end_of_data()` becomes true): a transformer sitting on top
//! of a socket needs that distinction to return control to the event loop instead
//! of blocking.

mod chunked;
mod growable;
mod inflate;
mod memory;

pub use chunked::{ChunkedDecoder, ChunkedEncoder};
pub use growable::GrowableStream;
pub use inflate::{ContentCoding, Inflate};
pub use memory::MemoryStream;

use crate::error::Result;

/// A readable byte stream. Not restartable: once bytes are consumed or the stream
/// reaches its end, there is no way to read them again.
pub trait ReadableStream: Send {
    /// Attempts to buffer up to `n` more bytes without blocking. Returns the
    /// number of bytes now available via `peek`/`consume` (which may be less than,
    /// more than, or equal to `n`, and may legally be `0` if nothing was ready).
    fn pull(&mut self, n: usize) -> Result<usize>;

    /// Returns the bytes currently buffered, without consuming them.
    fn peek(&self) -> &[u8];

    /// Removes and returns up to `n` buffered bytes, in order.
    fn consume(&mut self, n: usize) -> Vec<u8>;

    /// True once no further bytes will ever become available, and all buffered
    /// bytes have already been consumed.
    fn reached_end_of_data(&self) -> bool;

    /// The total length of the stream if known in advance (e.g. from
    /// Content-Length), or `None` if unknown (chunked, compressed, or otherwise
    /// unbounded).
    fn length(&self) -> Option<u64> {
        None
    }

    /// Releases any resources backing the stream. Must be safe to call more than
    /// once and safe to skip (callers on an error path may drop without calling
    /// it); implementations that truly need cleanup should also clean up on
    /// `Drop`.
    fn close_reading(&mut self) {}
}

/// A writable byte stream, e.g. a request body sink being framed for the wire.
pub trait WritableStream: Send {
    fn append_bytes(&mut self, chunk: &[u8]) -> Result<()>;

    /// Must be idempotent and safe to call from every exit path (including error
    /// paths), per the contract's "guaranteed close" requirement.
    fn close_writing(&mut self) -> Result<()>;
}

/// Drains every remaining byte from `stream` into a `Vec`.
///
/// Only meaningful for streams that make all of their progress synchronously
/// inside `pull` (a `MemoryStream`, or a transformer stack built on one) — used by
/// cache replay and by tests. A stream backed by a live socket should instead be
/// driven incrementally by the transport's `event_loop_tick`, since `pull`
/// returning `0` there means "come back later", not "nothing left, ever".
pub fn drain_all(stream: &mut dyn ReadableStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let n = stream.pull(64 * 1024)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&stream.consume(n));
    }
}
