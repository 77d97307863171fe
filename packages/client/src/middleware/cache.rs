//! Disk-cache replay: a fresh hit is served without ever reaching the wrapped
//! stage; a stale-but-revalidatable hit adds conditional headers and, on a
//! `304`, replays the cached body instead of forwarding the empty response.

use std::collections::HashMap;

use http::{HeaderValue, Method};

use crate::cache::{self, CacheRecord, CacheStore};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::middleware::Stage;
use crate::model::{next_request_id, Event, Request, RequestId, RequestState, Response};

/// The maximum size of a single cache-replay body chunk, matching the
/// network path's own natural read granularity.
const REPLAY_CHUNK_SIZE: usize = 64 * 1024;

/// A fully-resolved cache hit, replayed to the consumer as GOT_HEADERS, then
/// one or more BODY_CHUNK_AVAILABLE events of at most `REPLAY_CHUNK_SIZE`
/// bytes each, then FINISHED — the same event shape a live fetch produces.
struct SyntheticEntry {
    request: Request,
    body: Vec<u8>,
    cursor: usize,
    got_headers_pending: bool,
    finished_pending: bool,
}

impl SyntheticEntry {
    fn from_cache(record: CacheRecord, body: Vec<u8>) -> Result<Self> {
        let mut request = Request::new(Method::GET, record.url.as_str(), http::HeaderMap::new(), None)?;
        request.state = RequestState::Received;
        request.response = Some(Response {
            protocol: "HTTP/1.1".to_string(),
            status: record.status,
            status_message: record.status_message.clone(),
            headers: record.to_headers(),
            received_bytes: body.len() as u64,
            total_bytes: Some(body.len() as u64),
        });
        Ok(SyntheticEntry { request, body, cursor: 0, got_headers_pending: true, finished_pending: true })
    }

    fn pending_event(&self) -> Option<Event> {
        if self.got_headers_pending {
            Some(Event::GotHeaders)
        } else if self.cursor < self.body.len() {
            Some(Event::BodyChunkAvailable)
        } else if self.finished_pending {
            Some(Event::Finished)
        } else {
            None
        }
    }

    fn acknowledge(&mut self, event: Event) {
        match event {
            Event::GotHeaders => self.got_headers_pending = false,
            Event::Finished => {
                self.finished_pending = false;
                self.request.state = RequestState::Finished;
            }
            Event::BodyChunkAvailable | Event::Failed => {}
        }
    }

    fn take_chunk(&mut self) -> Vec<u8> {
        let end = (self.cursor + REPLAY_CHUNK_SIZE).min(self.body.len());
        let chunk = self.body[self.cursor..end].to_vec();
        self.cursor = end;
        chunk
    }
}

enum Mode {
    /// Forwarded to the wrapped stage under `internal`. `capture`, when
    /// `Some`, accumulates every byte drained via `take_body_chunk` so the
    /// full body is available to write to disk once `Finished` fires.
    PassThrough { internal: RequestId, url: String, request_headers: http::HeaderMap, capture: Option<Vec<u8>> },
    /// Forwarded with conditional headers added; `cached` is what gets
    /// served back out if the origin answers `304`.
    Revalidating { internal: RequestId, url: String, cached: CacheRecord },
    /// Resolved entirely from disk; the wrapped stage never saw this request.
    Synthetic(SyntheticEntry),
}

pub struct CacheMiddleware<S> {
    inner: S,
    store: CacheStore,
    modes: HashMap<RequestId, Mode>,
}

impl<S: Stage> CacheMiddleware<S> {
    pub fn new(inner: S, cache_dir: impl Into<std::path::PathBuf>) -> Self {
        CacheMiddleware { inner, store: CacheStore::new(cache_dir), modes: HashMap::new() }
    }

    fn maybe_store(&mut self, external: RequestId, internal: RequestId) {
        let Some(Mode::PassThrough { url, request_headers, capture: Some(body), .. }) = self.modes.get(&external)
        else {
            return;
        };
        let Some(response) = self.inner.request(internal).and_then(|r| r.response.as_ref()) else { return };
        if !CacheRecord::is_cacheable_status(response.status)
            || CacheRecord::is_no_store(response)
            || CacheRecord::has_vary_star(response)
        {
            return;
        }
        let record = CacheRecord::from_response(url, response);
        let _ = self.store.store(url, request_headers, &record, body);
    }
}

impl<S: Stage> Stage for CacheMiddleware<S> {
    fn enqueue(&mut self, mut request: Request) -> RequestId {
        let cacheable_method = matches!(request.method, Method::GET | Method::HEAD);
        let client_forbids_cache = request
            .headers
            .get(http::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|d| matches!(d.trim().to_ascii_lowercase().as_str(), "no-store" | "no-cache")))
            .unwrap_or(false);
        let url = request.url.as_str().to_string();

        if !cacheable_method {
            if self.store.load(&url, &request.headers).is_some() {
                tracing::debug!(url = %url, "cache invalidate: unsafe method on cached url");
                self.store.invalidate(&url);
            }
            let internal = self.inner.enqueue(request);
            let external = next_request_id();
            self.modes.insert(external, Mode::PassThrough { internal, url, request_headers: http::HeaderMap::new(), capture: None });
            return external;
        }

        if !client_forbids_cache {
            if let Some((record, body)) = self.store.load(&url, &request.headers) {
                let now = cache_now_ms();
                if cache::is_fresh(&record, now) {
                    tracing::debug!(url = %url, "cache hit: fresh");
                    if let Ok(entry) = SyntheticEntry::from_cache(record, body) {
                        let external = next_request_id();
                        self.modes.insert(external, Mode::Synthetic(entry));
                        return external;
                    }
                } else if record.etag.is_some() || record.last_modified.is_some() {
                    tracing::debug!(url = %url, "cache hit: stale, revalidating");
                    if let Some(etag) = &record.etag {
                        if let Ok(value) = HeaderValue::from_str(etag) {
                            request.headers.insert(http::header::IF_NONE_MATCH, value);
                        }
                    }
                    if let Some(last_modified) = &record.last_modified {
                        if let Ok(value) = HeaderValue::from_str(last_modified) {
                            request.headers.insert(http::header::IF_MODIFIED_SINCE, value);
                        }
                    }
                    let internal = self.inner.enqueue(request);
                    let external = next_request_id();
                    self.modes.insert(external, Mode::Revalidating { internal, url, cached: record });
                    return external;
                }
            } else {
                tracing::debug!(url = %url, "cache miss");
            }
        }

        let capture: Option<Vec<u8>> = (cacheable_method && !client_forbids_cache).then(Vec::new);
        let request_headers = request.headers.clone();
        let internal = self.inner.enqueue(request);
        let external = next_request_id();
        self.modes.insert(external, Mode::PassThrough { internal, url, request_headers, capture });
        external
    }

    fn tick(&mut self, config: &ClientConfig) -> Result<bool> {
        self.inner.tick(config)
    }

    fn pending_event(&mut self, external: RequestId) -> Option<Event> {
        enum Snapshot {
            Synthetic,
            Revalidating(RequestId, CacheRecord, String),
            PassThrough(RequestId),
        }
        let snapshot = match self.modes.get(&external)? {
            Mode::Synthetic(_) => Snapshot::Synthetic,
            Mode::Revalidating { internal, cached, url } => Snapshot::Revalidating(*internal, cached.clone(), url.clone()),
            Mode::PassThrough { internal, .. } => Snapshot::PassThrough(*internal),
        };

        match snapshot {
            Snapshot::Synthetic => {
                let Some(Mode::Synthetic(entry)) = self.modes.get(&external) else { return None };
                entry.pending_event()
            }
            Snapshot::Revalidating(internal, cached, url) => {
                let event = self.inner.pending_event(internal)?;
                if event != Event::GotHeaders {
                    return Some(event);
                }
                let status = self.inner.request(internal).and_then(|r| r.response.as_ref()).map(|r| r.status);
                self.inner.acknowledge(internal, Event::GotHeaders);

                if status == Some(304) {
                    tracing::debug!(url = %url, "cache revalidated: 304, serving cached body");
                    let mut refreshed = cached;
                    refreshed.stored_at_ms = cache_now_ms();
                    let body = self.store.load(&url, &http::HeaderMap::new()).map(|(_, b)| b).unwrap_or_default();
                    let _ = self.store.store(&url, &http::HeaderMap::new(), &refreshed, &body);
                    if let Ok(entry) = SyntheticEntry::from_cache(refreshed, body) {
                        self.modes.insert(external, Mode::Synthetic(entry));
                    }
                } else {
                    let request_headers =
                        self.inner.request(internal).map(|r| r.headers.clone()).unwrap_or_default();
                    self.modes.insert(
                        external,
                        Mode::PassThrough { internal, url, request_headers, capture: Some(Vec::new()) },
                    );
                }
                self.pending_event(external)
            }
            Snapshot::PassThrough(internal) => {
                let event = self.inner.pending_event(internal)?;
                if event == Event::Finished {
                    self.maybe_store(external, internal);
                }
                Some(event)
            }
        }
    }

    fn acknowledge(&mut self, external: RequestId, event: Event) {
        match self.modes.get_mut(&external) {
            Some(Mode::Synthetic(entry)) => entry.acknowledge(event),
            Some(Mode::PassThrough { internal, .. }) | Some(Mode::Revalidating { internal, .. }) => {
                self.inner.acknowledge(*internal, event);
            }
            None => {}
        }
    }

    fn request(&self, external: RequestId) -> Option<&Request> {
        match self.modes.get(&external)? {
            Mode::Synthetic(entry) => Some(&entry.request),
            Mode::PassThrough { internal, .. } | Mode::Revalidating { internal, .. } => self.inner.request(*internal),
        }
    }

    fn request_mut(&mut self, external: RequestId) -> Option<&mut Request> {
        match self.modes.get_mut(&external)? {
            Mode::Synthetic(entry) => Some(&mut entry.request),
            Mode::PassThrough { internal, .. } | Mode::Revalidating { internal, .. } => self.inner.request_mut(*internal),
        }
    }

    fn active_ids(&self) -> Vec<RequestId> {
        self.modes
            .iter()
            .filter(|(_, mode)| match mode {
                Mode::Synthetic(entry) => !entry.request.state.is_terminal(),
                Mode::PassThrough { internal, .. } | Mode::Revalidating { internal, .. } => {
                    self.inner.request(*internal).is_some_and(|r| !r.state.is_terminal())
                }
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn take_body_chunk(&mut self, external: RequestId) -> Vec<u8> {
        enum Snapshot {
            Synthetic,
            PassThrough(RequestId),
            Revalidating(RequestId),
        }
        let snapshot = match self.modes.get(&external) {
            Some(Mode::Synthetic(_)) => Snapshot::Synthetic,
            Some(Mode::PassThrough { internal, .. }) => Snapshot::PassThrough(*internal),
            Some(Mode::Revalidating { internal, .. }) => Snapshot::Revalidating(*internal),
            None => return Vec::new(),
        };

        match snapshot {
            Snapshot::Synthetic => {
                let Some(Mode::Synthetic(entry)) = self.modes.get_mut(&external) else { return Vec::new() };
                entry.take_chunk()
            }
            Snapshot::PassThrough(internal) => {
                let chunk = self.inner.take_body_chunk(internal);
                if let Some(Mode::PassThrough { capture: Some(buf), .. }) = self.modes.get_mut(&external) {
                    buf.extend_from_slice(&chunk);
                }
                chunk
            }
            Snapshot::Revalidating(internal) => self.inner.take_body_chunk(internal),
        }
    }
}

fn cache_now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
