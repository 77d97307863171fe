//! A byte buffer fed incrementally by a live I/O source (a socket, or curl's
//! write callback) and drained through the same pull-based contract as every
//! other stream. Unlike `MemoryStream`, bytes may still be on their way: `pull`
//! returning `0` means "nothing new yet", not "nothing left, ever" — callers must
//! check `reached_end_of_data` separately, which only becomes true after
//! `mark_eof` has been called.

use crate::bytestream::ReadableStream;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct GrowableStream {
    data: Vec<u8>,
    position: usize,
    eof: bool,
}

impl GrowableStream {
    pub fn new() -> Self {
        GrowableStream::default()
    }

    /// Appends newly-received bytes. May be called any number of times before
    /// `mark_eof`.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Marks that no further bytes will ever arrive on this connection.
    pub fn mark_eof(&mut self) {
        self.eof = true;
    }
}

impl ReadableStream for GrowableStream {
    fn pull(&mut self, _n: usize) -> Result<usize> {
        Ok(self.data.len() - self.position)
    }

    fn peek(&self) -> &[u8] {
        &self.data[self.position..]
    }

    fn consume(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.data.len() - self.position);
        let out = self.data[self.position..self.position + n].to_vec();
        self.position += n;
        if self.position == self.data.len() {
            self.data.clear();
            self.position = 0;
        }
        out
    }

    fn reached_end_of_data(&self) -> bool {
        self.eof && self.position >= self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_eof_until_marked() {
        let mut s = GrowableStream::new();
        s.feed(b"ab");
        assert_eq!(s.pull(10).unwrap(), 2);
        assert_eq!(s.consume(2), b"ab");
        assert!(!s.reached_end_of_data());
        s.mark_eof();
        assert!(s.reached_end_of_data());
    }

    #[test]
    fn feed_after_partial_consume() {
        let mut s = GrowableStream::new();
        s.feed(b"abc");
        s.pull(0).unwrap();
        assert_eq!(s.consume(1), b"a");
        s.feed(b"def");
        assert_eq!(s.pull(0).unwrap(), 5);
        assert_eq!(s.consume(5), b"bcdef");
    }
}
