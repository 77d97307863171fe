//! The enqueue/await capability chain: `RedirectionMiddleware` wraps
//! `CacheMiddleware` wraps `HttpMiddleware`, which is the only stage that
//! actually owns a `Transport`. Each stage mints its own `RequestId` for
//! whatever it hands back to its caller and keeps a private mapping onto
//! whatever id the stage it wraps uses, so a stage can synthesize results
//! (a redirect hop, a cache replay) without the layers above or below ever
//! knowing the id changed underneath them.

mod cache;
mod http;
mod redirect;

pub use cache::CacheMiddleware;
pub use http::HttpMiddleware;
pub use redirect::RedirectionMiddleware;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::model::{Event, Request, RequestId};

pub trait Stage: Send {
    fn enqueue(&mut self, request: Request) -> RequestId;

    /// One non-blocking step of whatever this stage (or the stage it wraps)
    /// needs to make progress. Returns whether anything changed.
    fn tick(&mut self, config: &ClientConfig) -> Result<bool>;

    /// The next event pending for `id`, applying whatever transformation this
    /// stage is responsible for (following a redirect, replaying from cache)
    /// before the event is reported. Does not clear the event.
    fn pending_event(&mut self, id: RequestId) -> Option<Event>;

    /// Clears `event` for `id`.
    fn acknowledge(&mut self, id: RequestId, event: Event);

    fn request(&self, id: RequestId) -> Option<&Request>;
    fn request_mut(&mut self, id: RequestId) -> Option<&mut Request>;

    /// Every non-terminal id this stage's caller should still be polling.
    fn active_ids(&self) -> Vec<RequestId>;

    /// Drains whatever decoded body bytes are available for `id`. Safe to
    /// call repeatedly; returns an empty `Vec` once nothing new has arrived.
    fn take_body_chunk(&mut self, id: RequestId) -> Vec<u8>;
}
