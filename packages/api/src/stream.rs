//! The convenience stream adapter: fetch a URL and read its decoded body as
//! a plain [`ReadableStream`], without touching `enqueue`/`await_next_event`
//! directly.

use pullhttp_engine::bytestream::ReadableStream;
use pullhttp_engine::{Error, Event, Request, RequestId, Response, Result};

use crate::Client;

/// Drives one request to completion, buffering decoded body bytes as they
/// arrive and exposing them through the `ReadableStream` contract.
pub struct FetchStream<'a> {
    client: &'a mut Client,
    id: RequestId,
    buffer: Vec<u8>,
    got_headers: bool,
    done: bool,
}

impl<'a> FetchStream<'a> {
    pub(crate) fn new(client: &'a mut Client, id: RequestId) -> Self {
        FetchStream { client, id, buffer: Vec::new(), got_headers: false, done: false }
    }

    /// The request this stream is reading, as the client currently sees it.
    pub fn request(&self) -> Option<&Request> {
        self.client.get_request(self.id)
    }

    /// Ticks until headers have arrived (or the request has already failed),
    /// then returns the response.
    pub fn response(&mut self) -> Option<&Response> {
        self.advance_until(|this| this.got_headers || this.done);
        self.client.get_response(self.id)
    }

    /// The error that failed this request, if it did.
    pub fn error(&self) -> Option<&Error> {
        self.client.get_request(self.id).and_then(|r| r.error.as_ref())
    }

    fn advance_until(&mut self, mut satisfied: impl FnMut(&Self) -> bool) {
        while !satisfied(self) {
            match self.client.await_next_event(Some(&[self.id])) {
                Some((_, Event::GotHeaders)) => {
                    self.got_headers = true;
                    self.client.acknowledge(self.id, Event::GotHeaders);
                }
                Some((_, Event::BodyChunkAvailable)) => {
                    let chunk = self.client.get_response_body_chunk(self.id);
                    self.buffer.extend_from_slice(&chunk);
                    self.client.acknowledge(self.id, Event::BodyChunkAvailable);
                }
                Some((_, Event::Finished)) => {
                    self.client.acknowledge(self.id, Event::Finished);
                    self.done = true;
                }
                Some((_, Event::Failed)) => {
                    self.client.acknowledge(self.id, Event::Failed);
                    self.done = true;
                }
                None => break,
            }
        }
    }
}

impl<'a> ReadableStream for FetchStream<'a> {
    fn pull(&mut self, n: usize) -> Result<usize> {
        self.advance_until(|this| this.buffer.len() >= n || this.done);
        Ok(self.buffer.len())
    }

    fn peek(&self) -> &[u8] {
        &self.buffer
    }

    fn consume(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buffer.len());
        self.buffer.drain(..n).collect()
    }

    fn reached_end_of_data(&self) -> bool {
        self.done && self.buffer.is_empty()
    }

    fn length(&self) -> Option<u64> {
        self.client.get_response(self.id).and_then(|r| r.total_bytes)
    }
}
