//! An in-memory `ReadableStream` over a fixed byte buffer.
//!
//! Used for upload bodies the caller already has fully in memory, and for
//! replaying a cached response body. Every byte is "available" immediately, so
//! `pull` never legitimately returns less than what's left to give — it exists
//! mainly so `MemoryStream` can sit underneath a chunked-encoder or inflate
//! transformer without those transformers needing a special case.

use crate::bytestream::ReadableStream;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct MemoryStream {
    data: Vec<u8>,
    position: usize,
    buffered: usize,
}

impl MemoryStream {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        MemoryStream { data: data.into(), position: 0, buffered: 0 }
    }

    pub fn empty() -> Self {
        MemoryStream::new(Vec::new())
    }
}

impl ReadableStream for MemoryStream {
    fn pull(&mut self, _n: usize) -> Result<usize> {
        // Every remaining byte is already in memory, so buffering is trivial:
        // the whole remainder becomes available on the first pull.
        self.buffered = self.data.len() - self.position;
        Ok(self.buffered)
    }

    fn peek(&self) -> &[u8] {
        &self.data[self.position..self.position + self.buffered]
    }

    fn consume(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buffered);
        let out = self.data[self.position..self.position + n].to_vec();
        self.position += n;
        self.buffered -= n;
        out
    }

    fn reached_end_of_data(&self) -> bool {
        self.position >= self.data.len() && self.buffered == 0
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulls_all_bytes_immediately() {
        let mut s = MemoryStream::new(b"hello".to_vec());
        assert_eq!(s.pull(1).unwrap(), 5);
        assert_eq!(s.consume(5), b"hello");
        assert!(s.reached_end_of_data());
    }

    #[test]
    fn partial_consume_then_drain() {
        let mut s = MemoryStream::new(b"abcdef".to_vec());
        s.pull(10).unwrap();
        assert_eq!(s.consume(2), b"ab");
        assert!(!s.reached_end_of_data());
        assert_eq!(s.consume(10), b"cdef");
        assert!(s.reached_end_of_data());
    }
}
