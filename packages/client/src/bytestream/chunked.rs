//! HTTP/1.1 chunked transfer-encoding: `<hex-len>[;ext]\r\n<bytes>\r\n...0\r\n\r\n`.

use crate::bytestream::{ReadableStream, WritableStream};
use crate::error::{Error, Result};

#[derive(Debug, PartialEq, Eq)]
enum DecoderState {
    ChunkHeader,
    ChunkData { remaining: usize },
    ChunkTrailer,
    Trailers,
    Done,
}

/// Wraps a raw readable byte stream (e.g. a socket's inbound buffer) and exposes
/// the decoded body, discarding chunk framing and trailers.
pub struct ChunkedDecoder<S> {
    inner: S,
    state: DecoderState,
    raw: Vec<u8>,
    out: Vec<u8>,
}

impl<S: ReadableStream> ChunkedDecoder<S> {
    pub fn new(inner: S) -> Self {
        ChunkedDecoder { inner, state: DecoderState::ChunkHeader, raw: Vec::new(), out: Vec::new() }
    }

    /// Access to the wrapped source, for transports that need to feed it new
    /// bytes directly across ticks instead of only pulling through it.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    fn fill_raw(&mut self, want: usize) -> Result<()> {
        let n = self.inner.pull(want)?;
        if n > 0 {
            self.raw.extend_from_slice(&self.inner.consume(n));
        }
        Ok(())
    }

    fn find_crlf(&self) -> Option<usize> {
        self.raw.windows(2).position(|w| w == b"\r\n")
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            match self.state {
                DecoderState::ChunkHeader => {
                    let Some(pos) = self.find_crlf() else { return Ok(()) };
                    let line = self.raw.drain(..pos + 2).collect::<Vec<_>>();
                    let line = &line[..line.len() - 2];
                    let size_str = line
                        .split(|&b| b == b';')
                        .next()
                        .ok_or(Error::MalformedChunk)?;
                    let size_str =
                        std::str::from_utf8(size_str).map_err(|_| Error::MalformedChunk)?.trim();
                    let size = usize::from_str_radix(size_str, 16).map_err(|_| Error::MalformedChunk)?;
                    self.state = if size == 0 {
                        DecoderState::Trailers
                    } else {
                        DecoderState::ChunkData { remaining: size }
                    };
                }
                DecoderState::ChunkData { remaining } => {
                    if self.raw.is_empty() {
                        return Ok(());
                    }
                    let take = remaining.min(self.raw.len());
                    self.out.extend(self.raw.drain(..take));
                    let left = remaining - take;
                    self.state = if left == 0 {
                        DecoderState::ChunkTrailer
                    } else {
                        DecoderState::ChunkData { remaining: left }
                    };
                }
                DecoderState::ChunkTrailer => {
                    if self.raw.len() < 2 {
                        return Ok(());
                    }
                    if &self.raw[..2] != b"\r\n" {
                        return Err(Error::MalformedChunk);
                    }
                    self.raw.drain(..2);
                    self.state = DecoderState::ChunkHeader;
                }
                DecoderState::Trailers => {
                    let Some(pos) = self.find_crlf() else { return Ok(()) };
                    let is_empty_line = pos == 0;
                    self.raw.drain(..pos + 2);
                    if is_empty_line {
                        self.state = DecoderState::Done;
                    }
                }
                DecoderState::Done => return Ok(()),
            }
        }
    }
}

impl<S: ReadableStream> ReadableStream for ChunkedDecoder<S> {
    fn pull(&mut self, n: usize) -> Result<usize> {
        self.fill_raw(n.max(4096))?;
        self.advance()?;
        Ok(self.out.len())
    }

    fn peek(&self) -> &[u8] {
        &self.out
    }

    fn consume(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.out.len());
        self.out.drain(..n).collect()
    }

    fn reached_end_of_data(&self) -> bool {
        self.state == DecoderState::Done && self.out.is_empty()
    }
}

/// Frames a writable stream's input as chunked on the way out, emitting a final
/// zero-length chunk on close.
pub struct ChunkedEncoder<S: WritableStream> {
    inner: S,
    closed: bool,
}

impl<S: WritableStream> ChunkedEncoder<S> {
    pub fn new(inner: S) -> Self {
        ChunkedEncoder { inner, closed: false }
    }
}

impl<S: WritableStream> WritableStream for ChunkedEncoder<S> {
    fn append_bytes(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let mut framed = format!("{:x}\r\n", chunk.len()).into_bytes();
        framed.extend_from_slice(chunk);
        framed.extend_from_slice(b"\r\n");
        self.inner.append_bytes(&framed)
    }

    fn close_writing(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.inner.append_bytes(b"0\r\n\r\n")?;
        }
        self.inner.close_writing()
    }
}

impl<S: WritableStream> Drop for ChunkedEncoder<S> {
    fn drop(&mut self) {
        let _ = self.close_writing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytestream::{drain_all, MemoryStream};

    struct VecSink(Vec<u8>);
    impl WritableStream for VecSink {
        fn append_bytes(&mut self, chunk: &[u8]) -> Result<()> {
            self.0.extend_from_slice(chunk);
            Ok(())
        }
        fn close_writing(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn decodes_simple_chunked_body() {
        let raw = b"5\r\nHELLO\r\n0\r\n\r\n".to_vec();
        let mut decoder = ChunkedDecoder::new(MemoryStream::new(raw));
        let out = drain_all(&mut decoder).unwrap();
        assert_eq!(out, b"HELLO");
    }

    #[test]
    fn decodes_multiple_chunks_and_ignores_extensions() {
        let raw = b"3;ext=1\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n".to_vec();
        let mut decoder = ChunkedDecoder::new(MemoryStream::new(raw));
        let out = drain_all(&mut decoder).unwrap();
        assert_eq!(out, b"foobar");
    }

    #[test]
    fn rejects_non_hex_size() {
        let raw = b"zz\r\nHELLO\r\n".to_vec();
        let mut decoder = ChunkedDecoder::new(MemoryStream::new(raw));
        let err = drain_all(&mut decoder).unwrap_err();
        assert!(matches!(err, Error::MalformedChunk));
    }

    #[test]
    fn discards_trailers() {
        let raw = b"5\r\nHELLO\r\n0\r\nX-Trailer: yes\r\n\r\n".to_vec();
        let mut decoder = ChunkedDecoder::new(MemoryStream::new(raw));
        let out = drain_all(&mut decoder).unwrap();
        assert_eq!(out, b"HELLO");
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let mut encoder = ChunkedEncoder::new(VecSink(Vec::new()));
        encoder.append_bytes(b"HELLO").unwrap();
        encoder.append_bytes(b" WORLD").unwrap();
        encoder.close_writing().unwrap();
        let framed = encoder.inner.0.clone();

        let mut decoder = ChunkedDecoder::new(MemoryStream::new(framed));
        let out = drain_all(&mut decoder).unwrap();
        assert_eq!(out, b"HELLO WORLD");
    }
}
