//! Content-Encoding decompression: gzip, raw deflate, or a pass-through identity
//! mode, wrapping a streaming decompressor from `flate2`.

use flate2::{Decompress as RawDecompress, Status};

use crate::bytestream::ReadableStream;
use crate::error::{Error, Result};

// `flate2::Decompress` understands raw DEFLATE or zlib-wrapped DEFLATE, selected
// by its `zlib_header` constructor flag. `Content-Encoding: deflate` means raw
// DEFLATE framing (no zlib wrapper), so `Decompress` is always built with
// `zlib_header: false`. Gzip is a 10-byte header + raw DEFLATE body + 8-byte
// CRC32/ISIZE trailer, so gzip mode strips the header itself here and feeds the
// body through the same raw `Decompress`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    Gzip,
    Deflate,
}

impl ContentCoding {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "identity" | "" => Ok(ContentCoding::Identity),
            "gzip" | "x-gzip" => Ok(ContentCoding::Gzip),
            "deflate" => Ok(ContentCoding::Deflate),
            other => Err(Error::UnsupportedEncoding { encoding: other.to_string() }),
        }
    }
}

enum GzipPhase {
    Header,
    Body,
    Trailer,
}

/// Wraps a readable stream of compressed bytes and exposes the decompressed
/// content. `identity` mode is a transparent pass-through.
pub struct Inflate<S> {
    inner: S,
    coding: ContentCoding,
    decompress: RawDecompress,
    gzip_phase: GzipPhase,
    compressed_buf: Vec<u8>,
    out: Vec<u8>,
    finished: bool,
}

impl<S: ReadableStream> Inflate<S> {
    pub fn new(inner: S, coding: ContentCoding) -> Self {
        Inflate {
            inner,
            coding,
            decompress: RawDecompress::new(false),
            gzip_phase: GzipPhase::Header,
            compressed_buf: Vec::new(),
            out: Vec::new(),
            finished: false,
        }
    }

    /// Access to the wrapped source, for transports that need to feed it new
    /// bytes directly across ticks instead of only pulling through it.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    fn pull_compressed(&mut self, n: usize) -> Result<()> {
        let got = self.inner.pull(n)?;
        if got > 0 {
            self.compressed_buf.extend_from_slice(&self.inner.consume(got));
        }
        Ok(())
    }

    fn strip_gzip_header(&mut self) -> Result<bool> {
        // Fixed 10-byte header: magic(2) method(1) flags(1) mtime(4) xfl(1) os(1).
        if self.compressed_buf.len() < 10 {
            return Ok(false);
        }
        if self.compressed_buf[0] != 0x1f || self.compressed_buf[1] != 0x8b {
            return Err(Error::DecodeError { message: "bad gzip magic bytes".into() });
        }
        let flags = self.compressed_buf[3];
        let mut pos = 10;
        if flags & 0x04 != 0 {
            // FEXTRA
            if self.compressed_buf.len() < pos + 2 {
                return Ok(false);
            }
            let xlen = u16::from_le_bytes([self.compressed_buf[pos], self.compressed_buf[pos + 1]]) as usize;
            pos += 2 + xlen;
        }
        for flag_bit in [0x08u8, 0x10u8] {
            // FNAME, FCOMMENT: NUL-terminated
            if flags & flag_bit != 0 {
                let Some(rel) = self.compressed_buf[pos..].iter().position(|&b| b == 0) else {
                    return Ok(false);
                };
                pos += rel + 1;
            }
        }
        if flags & 0x02 != 0 {
            // FHCRC
            pos += 2;
        }
        if self.compressed_buf.len() < pos {
            return Ok(false);
        }
        self.compressed_buf.drain(..pos);
        Ok(true)
    }

    fn decode_available(&mut self) -> Result<()> {
        if self.coding == ContentCoding::Gzip {
            if matches!(self.gzip_phase, GzipPhase::Header) {
                if !self.strip_gzip_header()? {
                    return Ok(());
                }
                self.gzip_phase = GzipPhase::Body;
            }
        }
        if self.compressed_buf.is_empty() || self.finished {
            return Ok(());
        }
        let mut scratch = [0u8; 8192];
        loop {
            if self.compressed_buf.is_empty() {
                return Ok(());
            }
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(&self.compressed_buf, &mut scratch, flate2::FlushDecompress::None)
                .map_err(|e| Error::DecodeError { message: e.to_string() })?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            self.compressed_buf.drain(..consumed);
            self.out.extend_from_slice(&scratch[..produced]);
            if status == Status::StreamEnd {
                self.finished = true;
                // gzip has an 8-byte CRC32+ISIZE trailer we don't validate further.
                self.gzip_phase = GzipPhase::Trailer;
                return Ok(());
            }
            if consumed == 0 && produced == 0 {
                return Ok(());
            }
        }
    }
}

impl<S: ReadableStream> ReadableStream for Inflate<S> {
    fn pull(&mut self, n: usize) -> Result<usize> {
        if self.coding == ContentCoding::Identity {
            let got = self.inner.pull(n)?;
            if got > 0 {
                self.out.extend_from_slice(&self.inner.consume(got));
            }
            return Ok(self.out.len());
        }
        self.pull_compressed(n.max(4096))?;
        self.decode_available()?;
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
        match self.coding {
            ContentCoding::Identity => self.inner.reached_end_of_data() && self.out.is_empty(),
            _ => self.finished && self.out.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytestream::{drain_all, MemoryStream};
    use std::io::Write;

    fn gzip_of(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn deflate_of(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn identity_passes_through() {
        let mut s = Inflate::new(MemoryStream::new(b"HELLO".to_vec()), ContentCoding::Identity);
        assert_eq!(drain_all(&mut s).unwrap(), b"HELLO");
    }

    #[test]
    fn gzip_round_trip() {
        let compressed = gzip_of(b"HELLO HELLO HELLO");
        let mut s = Inflate::new(MemoryStream::new(compressed), ContentCoding::Gzip);
        assert_eq!(drain_all(&mut s).unwrap(), b"HELLO HELLO HELLO");
    }

    #[test]
    fn deflate_round_trip() {
        let compressed = deflate_of(b"some deflate body");
        let mut s = Inflate::new(MemoryStream::new(compressed), ContentCoding::Deflate);
        assert_eq!(drain_all(&mut s).unwrap(), b"some deflate body");
    }

    #[test]
    fn rejects_unsupported_encoding_name() {
        assert!(matches!(
            ContentCoding::parse("br"),
            Err(Error::UnsupportedEncoding { .. })
        ));
    }

    #[test]
    fn rejects_corrupted_gzip() {
        let mut garbage = gzip_of(b"data");
        let len = garbage.len();
        garbage[len - 1] ^= 0xFF;
        garbage[len - 2] ^= 0xFF;
        let mut s = Inflate::new(MemoryStream::new(garbage), ContentCoding::Gzip);
        // Either a decode error, or (if only the trailer was corrupted) a mismatch
        // versus the original; assert we don't silently return wrong data.
        match drain_all(&mut s) {
            Ok(out) => assert_ne!(out, b"data"),
            Err(Error::DecodeError { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
