//! Transparent redirect following: a 3xx `GotHeaders` for the wrapped stage's
//! current id is swallowed and replaced with a newly enqueued child request,
//! with the external id the caller already has kept stable across however
//! many hops it takes to land on a non-redirect response.

use std::collections::HashMap;

use http::Method;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::middleware::Stage;
use crate::model::{Event, Request, RequestId};
use crate::url::resolve_redirect;

pub struct RedirectionMiddleware<S> {
    inner: S,
    max_redirects: u32,
    /// external id (the first hop's id) -> whichever hop is currently live.
    current: HashMap<RequestId, RequestId>,
    hops: HashMap<RequestId, u32>,
}

impl<S: Stage> RedirectionMiddleware<S> {
    pub fn new(inner: S, max_redirects: u32) -> Self {
        RedirectionMiddleware { inner, max_redirects, current: HashMap::new(), hops: HashMap::new() }
    }

    /// Inspects the just-completed hop `internal` and, if its response is a
    /// redirect this client should follow, enqueues the next hop and returns
    /// its id. Returns `Ok(None)` when the response isn't a redirect at all.
    fn follow(&mut self, external: RequestId, internal: RequestId) -> Result<Option<RequestId>> {
        let Some(req) = self.inner.request(internal) else { return Ok(None) };
        let Some(response) = req.response.as_ref() else { return Ok(None) };
        if !matches!(response.status, 301 | 302 | 303 | 307 | 308) {
            return Ok(None);
        }
        let Some(location) = response.header_str("location").map(str::to_string) else { return Ok(None) };

        let hops = *self.hops.get(&external).unwrap_or(&0);
        if hops >= self.max_redirects {
            return Err(Error::TooManyRedirects);
        }

        let url = req.url.clone();
        let method = req.method.clone();
        let mut headers = req.headers.clone();
        let upload_present = req.upload_body.is_some();
        let upload_consumed = req.upload_body_consumed;
        let status = response.status;

        let new_url = resolve_redirect(&url, &location).map_err(|e| Error::invalid_redirect_url(&location, e))?;

        let (new_method, keep_body) = match status {
            301 | 302 if method == Method::POST => (Method::GET, false),
            303 => (Method::GET, false),
            301 | 302 | 307 | 308 => (method.clone(), true),
            _ => (method.clone(), false),
        };

        if keep_body && upload_present && upload_consumed {
            return Err(Error::UnreplayableBody);
        }

        headers.remove(http::header::CONTENT_LENGTH);
        headers.remove(http::header::TRANSFER_ENCODING);
        headers.remove(http::header::HOST);
        if new_url.host_str() != url.host_str() {
            headers.remove(http::header::AUTHORIZATION);
            headers.remove(http::header::COOKIE);
        }

        let body = if keep_body {
            self.inner.request_mut(internal).and_then(|r| r.upload_body.take()).map(|b| (b, None))
        } else {
            None
        };

        let mut child = Request::new(new_method, new_url, headers, body)?;
        child.redirected_from = Some(internal);
        let child_id = self.inner.enqueue(child);
        if let Some(parent) = self.inner.request_mut(internal) {
            parent.redirected_to = Some(child_id);
        }
        self.hops.insert(external, hops + 1);
        Ok(Some(child_id))
    }
}

impl<S: Stage> Stage for RedirectionMiddleware<S> {
    fn enqueue(&mut self, request: Request) -> RequestId {
        let id = self.inner.enqueue(request);
        self.current.insert(id, id);
        self.hops.insert(id, 0);
        id
    }

    fn tick(&mut self, config: &ClientConfig) -> Result<bool> {
        self.inner.tick(config)
    }

    fn pending_event(&mut self, external: RequestId) -> Option<Event> {
        let internal = *self.current.get(&external)?;
        let event = self.inner.pending_event(internal)?;
        if event != Event::GotHeaders {
            return Some(event);
        }

        match self.follow(external, internal) {
            Ok(Some(child_id)) => {
                self.inner.acknowledge(internal, Event::GotHeaders);
                self.current.insert(external, child_id);
                self.pending_event(external)
            }
            Ok(None) => Some(event),
            Err(e) => {
                self.inner.acknowledge(internal, Event::GotHeaders);
                if let Some(req) = self.inner.request_mut(internal) {
                    req.fail(e);
                }
                Some(Event::Failed)
            }
        }
    }

    fn acknowledge(&mut self, external: RequestId, event: Event) {
        if let Some(&internal) = self.current.get(&external) {
            self.inner.acknowledge(internal, event);
        }
    }

    fn request(&self, external: RequestId) -> Option<&Request> {
        let internal = *self.current.get(&external)?;
        self.inner.request(internal)
    }

    fn request_mut(&mut self, external: RequestId) -> Option<&mut Request> {
        let internal = *self.current.get(&external)?;
        self.inner.request_mut(internal)
    }

    fn active_ids(&self) -> Vec<RequestId> {
        self.current.keys().copied().collect()
    }

    fn take_body_chunk(&mut self, external: RequestId) -> Vec<u8> {
        let Some(&internal) = self.current.get(&external) else { return Vec::new() };
        self.inner.take_body_chunk(internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PendingEvents, Response};
    use http::HeaderMap;
    use std::collections::HashMap as Map;

    /// A tiny in-memory `Stage` stand-in for exercising the redirect logic
    /// without a real transport.
    struct FakeStage {
        requests: Map<RequestId, Request>,
        pending: Map<RequestId, PendingEvents>,
    }

    impl FakeStage {
        fn new() -> Self {
            FakeStage { requests: Map::new(), pending: Map::new() }
        }

        fn complete(&mut self, id: RequestId, status: u16, location: Option<&str>) {
            let mut headers = HeaderMap::new();
            if let Some(loc) = location {
                headers.insert(http::header::LOCATION, loc.parse().unwrap());
            }
            if let Some(req) = self.requests.get_mut(&id) {
                req.response = Some(Response {
                    protocol: "HTTP/1.1".into(),
                    status,
                    status_message: None,
                    headers,
                    received_bytes: 0,
                    total_bytes: Some(0),
                });
            }
            self.pending.entry(id).or_default().got_headers = true;
        }
    }

    impl Stage for FakeStage {
        fn enqueue(&mut self, request: Request) -> RequestId {
            let id = request.id;
            self.requests.insert(id, request);
            self.pending.insert(id, PendingEvents::default());
            id
        }

        fn tick(&mut self, _config: &ClientConfig) -> Result<bool> {
            Ok(false)
        }

        fn pending_event(&mut self, id: RequestId) -> Option<Event> {
            self.pending.get(&id).copied().unwrap_or_default().highest_priority()
        }

        fn acknowledge(&mut self, id: RequestId, event: Event) {
            self.pending.entry(id).or_default().clear(event);
        }

        fn request(&self, id: RequestId) -> Option<&Request> {
            self.requests.get(&id)
        }

        fn request_mut(&mut self, id: RequestId) -> Option<&mut Request> {
            self.requests.get_mut(&id)
        }

        fn active_ids(&self) -> Vec<RequestId> {
            self.requests.keys().copied().collect()
        }

        fn take_body_chunk(&mut self, _id: RequestId) -> Vec<u8> {
            Vec::new()
        }
    }

    #[test]
    fn follows_a_single_redirect_transparently() {
        let mut mw = RedirectionMiddleware::new(FakeStage::new(), 5);
        let req = Request::new(Method::GET, "http://example.com/old", HeaderMap::new(), None).unwrap();
        let external = mw.enqueue(req);

        mw.inner.complete(external, 302, Some("/new"));
        let event = mw.pending_event(external);
        assert_eq!(event, None, "a bare 302 with no terminal event yet should wait for the child hop");

        let child_id = *mw.current.get(&external).unwrap();
        assert_ne!(child_id, external);
        assert_eq!(mw.request(external).unwrap().url.path(), "/new");

        mw.inner.complete(child_id, 200, None);
        assert_eq!(mw.pending_event(external), Some(Event::GotHeaders));
    }

    #[test]
    fn too_many_redirects_fails_the_request() {
        let mut mw = RedirectionMiddleware::new(FakeStage::new(), 1);
        let req = Request::new(Method::GET, "http://example.com/a", HeaderMap::new(), None).unwrap();
        let external = mw.enqueue(req);
        mw.inner.complete(external, 302, Some("/b"));
        mw.pending_event(external);

        let hop2 = *mw.current.get(&external).unwrap();
        mw.inner.complete(hop2, 302, Some("/c"));
        assert_eq!(mw.pending_event(external), Some(Event::Failed));
    }

    #[test]
    fn post_redirected_with_303_becomes_get() {
        let mut mw = RedirectionMiddleware::new(FakeStage::new(), 5);
        let req = Request::new(Method::POST, "http://example.com/submit", HeaderMap::new(), None).unwrap();
        let external = mw.enqueue(req);
        mw.inner.complete(external, 303, Some("/done"));
        mw.pending_event(external);

        assert_eq!(mw.request(external).unwrap().method, Method::GET);
    }
}
