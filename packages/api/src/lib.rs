//! `pullhttp`: the public facade over `pullhttp-engine`'s event-driven
//! HTTP/1.1 client.
//!
//! A [`Client`] drives one non-reentrant event loop. There is no background
//! thread and no async runtime involved: a consumer enqueues requests, then
//! repeatedly calls [`Client::await_next_event`] (or polls [`Client::get_event`]
//! directly) until every request it cares about has reached a terminal event,
//! draining response bodies with [`Client::get_response_body_chunk`] as they
//! arrive.
//!
//! ```no_run
//! use pullhttp::{Client, Event};
//!
//! let mut client = Client::new().unwrap();
//! let id = client.request().get("https://example.com").unwrap();
//! loop {
//!     match client.await_next_event(Some(&[id])) {
//!         Some((_, Event::BodyChunkAvailable)) => {
//!             let chunk = client.get_response_body_chunk(id);
//!             client.acknowledge(id, Event::BodyChunkAvailable);
//!             print!("{}", String::from_utf8_lossy(&chunk));
//!         }
//!         Some((_, Event::GotHeaders)) => client.acknowledge(id, Event::GotHeaders),
//!         Some((_, Event::Finished | Event::Failed)) | None => break,
//!     }
//! }
//! ```

#![warn(clippy::all)]

pub mod builder;
mod stream;

pub use builder::RequestBuilder;
pub use pullhttp_engine::{
    ClientConfig, ClientConfigBuilder, Error, Event, IntoUrl, Request, RequestId, RequestState,
    Response, Result, TransportKind,
};
pub use stream::FetchStream;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use pullhttp_engine::Engine;

/// Builds a [`Client`], mirroring [`ClientConfigBuilder`]'s option set.
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfigBuilder,
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    #[must_use]
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config = self.config.concurrency(n);
        self
    }

    #[must_use]
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config = self.config.timeout_ms(ms);
        self
    }

    #[must_use]
    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.config = self.config.transport(kind);
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, n: u32) -> Self {
        self.config = self.config.max_redirects(n);
        self
    }

    #[must_use]
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config = self.config.cache_dir(dir);
        self
    }

    #[must_use]
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config = self.config.user_agent(ua);
        self
    }

    pub fn build(self) -> Result<Client> {
        Ok(Client { engine: Engine::new(self.config.build())? })
    }
}

/// The pull-driven client. Every method takes `&mut self` (or just `&self`
/// for pure lookups): the engine is single-threaded and non-reentrant by
/// design, so there is nothing to lock.
pub struct Client {
    engine: Engine,
}

impl Client {
    /// A client with every default from the core's configuration surface
    /// (`concurrency` 10, `timeout_ms` 30000, auto transport, `max_redirects` 5,
    /// no cache).
    pub fn new() -> Result<Self> {
        ClientBuilder::new().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Starts building a request against this client. Call a terminal method
    /// (`get`, `post`, `put`, `patch`, `delete`, `head`) to enqueue it.
    pub fn request(&mut self) -> RequestBuilder<'_> {
        RequestBuilder::new(self)
    }

    /// Enqueues an already-constructed request.
    pub fn enqueue(&mut self, request: Request) -> RequestId {
        self.engine.enqueue(request)
    }

    /// Enqueues every request in `requests`, in order, returning their ids in
    /// the same order.
    pub fn enqueue_all(&mut self, requests: impl IntoIterator<Item = Request>) -> Vec<RequestId> {
        requests.into_iter().map(|r| self.enqueue(r)).collect()
    }

    /// Blocks, cooperatively ticking the engine, until one of `filter`'s
    /// requests (or, when `filter` is `None`, any currently active request)
    /// has a pending event. Returns `None` once the timeout budget — the
    /// configured per-request timeout plus ~10%, floored at 300ms — elapses
    /// without one, or once the engine itself reports an unrecoverable error.
    pub fn await_next_event(&mut self, filter: Option<&[RequestId]>) -> Option<(RequestId, Event)> {
        let deadline = Instant::now() + self.event_budget();
        loop {
            let candidates = match filter {
                Some(ids) => ids.to_vec(),
                None => self.engine.active_ids(),
            };
            for id in candidates {
                if let Some(event) = self.engine.pending_event(id) {
                    return Some((id, event));
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            if self.engine.tick().is_err() {
                return None;
            }
        }
    }

    fn event_budget(&self) -> Duration {
        let base = self.engine.config().timeout_ms;
        Duration::from_millis((base + base / 10).max(300))
    }

    /// The next pending event for `id`, without ticking or blocking.
    pub fn get_event(&mut self, id: RequestId) -> Option<Event> {
        self.engine.pending_event(id)
    }

    /// Clears `event` for `id` so it isn't reported again — call this after
    /// handling an event obtained from `get_event` or `await_next_event`.
    pub fn acknowledge(&mut self, id: RequestId, event: Event) {
        self.engine.acknowledge(id, event);
    }

    pub fn get_request(&self, id: RequestId) -> Option<&Request> {
        self.engine.request(id)
    }

    pub fn get_response(&self, id: RequestId) -> Option<&Response> {
        self.engine.request(id).and_then(|r| r.response.as_ref())
    }

    /// Drains whatever decoded response body bytes have arrived for `id`
    /// since the last call. Empty once nothing new has arrived yet.
    pub fn get_response_body_chunk(&mut self, id: RequestId) -> Vec<u8> {
        self.engine.take_body_chunk(id)
    }

    /// Every non-terminal request id, optionally narrowed to `states`.
    pub fn get_active_requests(&self, states: Option<&[RequestState]>) -> Vec<RequestId> {
        self.engine
            .active_ids()
            .into_iter()
            .filter(|&id| match states {
                None => true,
                Some(wanted) => self.engine.request(id).is_some_and(|r| wanted.contains(&r.state)),
            })
            .collect()
    }

    /// Fetches `url` and returns its decoded response body as a plain
    /// readable byte stream, driving `await_next_event` internally as the
    /// stream is pulled.
    pub fn fetch(&mut self, url: impl IntoUrl) -> Result<FetchStream<'_>> {
        let id = self.request().get(url)?;
        Ok(FetchStream::new(self, id))
    }

    pub fn config(&self) -> &ClientConfig {
        self.engine.config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_engine_defaults() {
        let client = Client::new().unwrap();
        assert_eq!(client.config().concurrency, 10);
        assert_eq!(client.config().max_redirects, 5);
    }

    #[test]
    fn builder_overrides_propagate() {
        let client = Client::builder().concurrency(3).max_redirects(1).build().unwrap();
        assert_eq!(client.config().concurrency, 3);
        assert_eq!(client.config().max_redirects, 1);
    }

    #[test]
    fn get_active_requests_empty_before_any_enqueue() {
        let client = Client::new().unwrap();
        assert!(client.get_active_requests(None).is_empty());
    }
}
