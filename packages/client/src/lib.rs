//! `pullhttp-engine`: the event loop, transports, and middleware chain behind
//! the `pullhttp` client facade.
//!
//! Nothing here spawns a thread or holds an async runtime. A caller drives
//! progress explicitly by calling [`Engine::tick`] and draining whatever
//! events [`Engine::pending_event`] reports; every `Engine` method is
//! non-reentrant and expected to be called from a single logical thread of
//! control, mirroring the request/response object model of `packages/api`.

pub mod bytestream;
pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod model;
pub mod state;
pub mod transport;
pub mod url;

pub use config::{ClientConfig, ClientConfigBuilder, TransportKind};
pub use error::{Error, Result};
pub use model::{Event, Request, RequestId, RequestState, Response};
pub use url::IntoUrl;

use middleware::{CacheMiddleware, HttpMiddleware, RedirectionMiddleware, Stage};
use transport::{MultiplexedTransport, SocketTransport, Transport};

/// The assembled middleware chain, parameterized over whether a disk cache
/// stage is present. `packages/api` talks to this through the `Stage` trait
/// alone so it never needs to know which variant it holds.
enum Chain {
    Cached(RedirectionMiddleware<CacheMiddleware<HttpMiddleware>>),
    Uncached(RedirectionMiddleware<HttpMiddleware>),
}

impl Stage for Chain {
    fn enqueue(&mut self, request: Request) -> RequestId {
        match self {
            Chain::Cached(c) => c.enqueue(request),
            Chain::Uncached(c) => c.enqueue(request),
        }
    }

    fn tick(&mut self, config: &ClientConfig) -> Result<bool> {
        match self {
            Chain::Cached(c) => c.tick(config),
            Chain::Uncached(c) => c.tick(config),
        }
    }

    fn pending_event(&mut self, id: RequestId) -> Option<Event> {
        match self {
            Chain::Cached(c) => c.pending_event(id),
            Chain::Uncached(c) => c.pending_event(id),
        }
    }

    fn acknowledge(&mut self, id: RequestId, event: Event) {
        match self {
            Chain::Cached(c) => c.acknowledge(id, event),
            Chain::Uncached(c) => c.acknowledge(id, event),
        }
    }

    fn request(&self, id: RequestId) -> Option<&Request> {
        match self {
            Chain::Cached(c) => c.request(id),
            Chain::Uncached(c) => c.request(id),
        }
    }

    fn request_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        match self {
            Chain::Cached(c) => c.request_mut(id),
            Chain::Uncached(c) => c.request_mut(id),
        }
    }

    fn active_ids(&self) -> Vec<RequestId> {
        match self {
            Chain::Cached(c) => c.active_ids(),
            Chain::Uncached(c) => c.active_ids(),
        }
    }

    fn take_body_chunk(&mut self, id: RequestId) -> Vec<u8> {
        match self {
            Chain::Cached(c) => c.take_body_chunk(id),
            Chain::Uncached(c) => c.take_body_chunk(id),
        }
    }
}

/// The whole engine: the enqueue/await surface `packages/api` drives.
pub struct Engine {
    chain: Chain,
    config: ClientConfig,
}

impl Engine {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport: Box<dyn Transport> = match config.transport {
            TransportKind::Socket => Box::new(SocketTransport::new()?),
            TransportKind::Curl => Box::new(MultiplexedTransport::new()?),
            TransportKind::Auto => match MultiplexedTransport::new() {
                Ok(t) => Box::new(t),
                Err(_) => Box::new(SocketTransport::new()?),
            },
        };
        let http = HttpMiddleware::new(transport, config.concurrency);
        let chain = match &config.cache_dir {
            Some(dir) => Chain::Cached(RedirectionMiddleware::new(
                CacheMiddleware::new(http, dir.clone()),
                config.max_redirects,
            )),
            None => Chain::Uncached(RedirectionMiddleware::new(http, config.max_redirects)),
        };
        Ok(Engine { chain, config })
    }

    pub fn enqueue(&mut self, request: Request) -> RequestId {
        self.chain.enqueue(request)
    }

    /// One non-blocking step. Returns whether anything changed; a caller
    /// polling for the next event should keep calling this until it returns
    /// `true` or its own deadline runs out.
    pub fn tick(&mut self) -> Result<bool> {
        self.chain.tick(&self.config)
    }

    pub fn pending_event(&mut self, id: RequestId) -> Option<Event> {
        self.chain.pending_event(id)
    }

    pub fn acknowledge(&mut self, id: RequestId, event: Event) {
        self.chain.acknowledge(id, event)
    }

    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.chain.request(id)
    }

    pub fn active_ids(&self) -> Vec<RequestId> {
        self.chain.active_ids()
    }

    pub fn take_body_chunk(&mut self, id: RequestId) -> Vec<u8> {
        self.chain.take_body_chunk(id)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
