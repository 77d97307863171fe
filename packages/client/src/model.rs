//! Request / Response / Connection data model and the per-request state machine.

use std::time::Instant;

use base64::Engine;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::bytestream::ReadableStream;
use crate::error::{Error, Result};
use crate::url::{strip_credentials, IntoUrl};

pub type RequestId = u64;

pub(crate) fn next_request_id() -> RequestId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// CREATED -> ENQUEUED -> (WILL_ENABLE_CRYPTO ->)? WILL_SEND_HEADERS ->
/// (WILL_SEND_BODY ->)? SENT -> RECEIVING_HEADERS -> RECEIVING_BODY -> RECEIVED ->
/// FINISHED; FAILED is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Created,
    Enqueued,
    WillEnableCrypto,
    WillSendHeaders,
    WillSendBody,
    Sent,
    ReceivingHeaders,
    ReceivingBody,
    Received,
    Finished,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Finished | RequestState::Failed)
    }
}

/// A logical HTTP request, owned by the Client from enqueue through to a terminal
/// state. The consumer may keep reading it afterwards to inspect the response and
/// redirect chain.
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub version: String,
    pub headers: HeaderMap,
    pub upload_body: Option<Box<dyn ReadableStream>>,
    pub upload_body_consumed: bool,
    pub redirected_from: Option<RequestId>,
    pub redirected_to: Option<RequestId>,
    pub error: Option<Error>,
    pub response: Option<Response>,
    pub cache_key: Option<String>,
    pub state: RequestState,
    pub started_at: Option<Instant>,
}

impl Request {
    /// Builds a new request, normalizing the URL (stripping embedded credentials
    /// into an Authorization header) and filling in the conservative default
    /// headers spec section 4.2 requires. `upload_body` may be `None`, or `Some`
    /// with or without a known length.
    pub fn new(
        method: Method,
        url: impl IntoUrl,
        mut headers: HeaderMap,
        upload_body: Option<(Box<dyn ReadableStream>, Option<u64>)>,
    ) -> Result<Self> {
        let mut url = url.into_url()?;

        if let Some(creds) = strip_credentials(&mut url) {
            let token = format!("{}:{}", creds.username, creds.password.unwrap_or_default());
            let encoded = base64::engine::general_purpose::STANDARD.encode(token);
            headers.entry(http::header::AUTHORIZATION).or_insert(
                HeaderValue::from_str(&format!("Basic {encoded}"))
                    .map_err(|e| Error::malformed_headers(e))?,
            );
        }

        if !headers.contains_key(http::header::HOST) {
            let host = url.host_str().ok_or(Error::InvalidScheme)?;
            let host_header = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            headers.insert(
                http::header::HOST,
                HeaderValue::from_str(&host_header).map_err(|e| Error::malformed_headers(e))?,
            );
        }
        headers
            .entry(http::header::USER_AGENT)
            .or_insert(HeaderValue::from_static(concat!("pullhttp/", env!("CARGO_PKG_VERSION"))));
        headers.entry(http::header::ACCEPT).or_insert(HeaderValue::from_static("*/*"));
        headers
            .entry(http::header::ACCEPT_LANGUAGE)
            .or_insert(HeaderValue::from_static("en-US,en;q=0.9"));
        headers
            .entry(http::header::CONNECTION)
            .or_insert(HeaderValue::from_static("close"));

        let (upload_body, known_length) = match upload_body {
            Some((stream, len)) => (Some(stream), len),
            None => (None, None),
        };
        if upload_body.is_some() {
            if let Some(len) = known_length {
                headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(len));
            } else {
                headers
                    .entry(http::header::TRANSFER_ENCODING)
                    .or_insert(HeaderValue::from_static("chunked"));
            }
        }

        Ok(Request {
            id: next_request_id(),
            url,
            method,
            version: "HTTP/1.1".to_string(),
            headers,
            upload_body,
            upload_body_consumed: false,
            redirected_from: None,
            redirected_to: None,
            error: None,
            response: None,
            cache_key: None,
            state: RequestState::Created,
            started_at: None,
        })
    }

    pub fn fail(&mut self, error: Error) {
        if !self.state.is_terminal() {
            self.state = RequestState::Failed;
            self.error = Some(error);
        }
    }

    /// Whether the upload body, if any, is safe to hand to a redirect child: it
    /// exists, and has not already started being consumed.
    pub fn body_is_replayable(&self) -> bool {
        self.upload_body.is_none() || !self.upload_body_consumed
    }
}

/// Constructed when the first byte of response headers arrives; sealed when
/// GOT_HEADERS is emitted. `total_bytes` comes from Content-Length, when present.
#[derive(Debug, Clone)]
pub struct Response {
    pub protocol: String,
    pub status: u16,
    pub status_message: Option<String>,
    pub headers: HeaderMap,
    pub received_bytes: u64,
    pub total_bytes: Option<u64>,
}

impl Response {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Parses a raw HTTP/1.x status line + header block (already stripped of the
/// terminating empty line), in either the traditional `HTTP/x.y <code> [msg]`
/// form (parsed with `httparse`) or the HTTP/2-style `:status: <code>`
/// pseudo-header form some embedded fixtures use, which `httparse` doesn't
/// understand and is handled separately. Any header line lacking a `":"`
/// separator is dropped before parsing rather than failing the whole block.
pub fn parse_response_head(raw: &[u8]) -> Result<Response> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();

    if let Some(rest) = status_line.strip_prefix(":status:") {
        return parse_pseudo_header_status(rest, lines);
    }

    let filtered: String = std::iter::once(status_line)
        .chain(lines.filter(|line| line.is_empty() || line.contains(':')))
        .collect::<Vec<_>>()
        .join("\r\n")
        + "\r\n\r\n";

    let mut header_slots = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_slots);
    let parse_status = parsed
        .parse(filtered.as_bytes())
        .map_err(|e| Error::MalformedHeaders { message: e.to_string() })?;
    if parse_status.is_partial() {
        return Err(Error::MalformedHeaders { message: "incomplete status line".into() });
    }

    let status = parsed.code.ok_or_else(|| Error::MalformedHeaders { message: "missing status code".into() })?;
    if !(100..=599).contains(&status) {
        return Err(Error::MalformedHeaders { message: format!("status {status} out of range") });
    }
    let protocol = match parsed.version {
        Some(0) => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
    .to_string();
    let status_message = parsed.reason.filter(|s| !s.is_empty()).map(str::to_string);

    let mut headers = HeaderMap::new();
    for h in parsed.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(h.name.as_bytes()) else { continue };
        let Ok(value) = HeaderValue::from_bytes(h.value) else { continue };
        headers.append(name, value);
    }

    let total_bytes = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    Ok(Response { protocol, status, status_message, headers, received_bytes: 0, total_bytes })
}

fn parse_pseudo_header_status<'a>(status_rest: &str, lines: impl Iterator<Item = &'a str>) -> Result<Response> {
    let status: u16 = status_rest
        .trim()
        .parse()
        .map_err(|_| Error::MalformedHeaders { message: format!("bad pseudo-header status: {status_rest:?}") })?;
    if !(100..=599).contains(&status) {
        return Err(Error::MalformedHeaders { message: format!("status {status} out of range") });
    }

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(": ") else { continue };
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else { continue };
        let Ok(value) = HeaderValue::from_str(value.trim()) else { continue };
        headers.append(name, value);
    }

    let total_bytes = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    Ok(Response { protocol: "HTTP/2".to_string(), status, status_message: None, headers, received_bytes: 0, total_bytes })
}

/// Returns the case-insensitive value of a single-valued header, keeping only the
/// last occurrence if the wire sent the header more than once (e.g. a duplicated
/// Set-Cookie), per the spec's single-valued map semantics.
pub fn last_header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get_all(name).iter().last().and_then(|v| v.to_str().ok())
}

/// Opaque per-request transport state: owns the socket/multi handle (erased
/// behind the transport implementation), a buffer of decoded body bytes the
/// transport has produced and the consumer hasn't yet pulled, and a start
/// timestamp for timeout enforcement.
///
/// The decoder stack (chunked framing, then content-encoding) lives inside the
/// transport's own handle, not here: it needs to persist state across ticks
/// while new wire bytes keep arriving, which a boxed `ReadableStream` can't do
/// without a second mutable handle onto the same buffer. `body_buffer` is the
/// plain, single-owner hand-off point instead.
pub struct Connection {
    pub request_id: RequestId,
    pub started_at: Instant,
    pub body_buffer: Vec<u8>,
    pub handle: Box<dyn std::any::Any + Send>,
}

impl Connection {
    pub fn new(request_id: RequestId, handle: Box<dyn std::any::Any + Send>) -> Self {
        Connection { request_id, started_at: Instant::now(), body_buffer: Vec::new(), handle }
    }

    pub fn take_body_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body_buffer)
    }
}

/// A tagged signal pulled from the Client by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    GotHeaders,
    BodyChunkAvailable,
    Failed,
    Finished,
}

/// Per-request pending-event bitset. `FAILED` and `FINISHED` are mutually
/// exclusive and terminal; `GOT_HEADERS` is set at most once per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingEvents {
    pub got_headers: bool,
    pub body_chunk_available: bool,
    pub failed: bool,
    pub finished: bool,
}

impl PendingEvents {
    /// The highest-priority pending event, per the fixed priority order
    /// GOT_HEADERS, BODY_CHUNK_AVAILABLE, FAILED, FINISHED.
    pub fn highest_priority(&self) -> Option<Event> {
        if self.got_headers {
            Some(Event::GotHeaders)
        } else if self.body_chunk_available {
            Some(Event::BodyChunkAvailable)
        } else if self.failed {
            Some(Event::Failed)
        } else if self.finished {
            Some(Event::Finished)
        } else {
            None
        }
    }

    pub fn clear(&mut self, event: Event) {
        match event {
            Event::GotHeaders => self.got_headers = false,
            Event::BodyChunkAvailable => self.body_chunk_available = false,
            Event::Failed => self.failed = false,
            Event::Finished => self.finished = false,
        }
    }

    pub fn any(&self) -> bool {
        self.got_headers || self.body_chunk_available || self.failed || self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_traditional_status_line() {
        let resp = parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n").unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.status_message.as_deref(), Some("OK"));
        assert_eq!(resp.total_bytes, Some(5));
    }

    #[test]
    fn parses_pseudo_header_status_line() {
        let resp = parse_response_head(b":status: 204\r\nx-foo: bar\r\n").unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(resp.status_message, None);
        assert_eq!(resp.header_str("x-foo"), Some("bar"));
    }

    #[test]
    fn rejects_out_of_range_status() {
        let err = parse_response_head(b"HTTP/1.1 999 Nope\r\n").unwrap_err();
        assert!(matches!(err, Error::MalformedHeaders { .. }));
    }

    #[test]
    fn discards_malformed_header_lines() {
        let resp = parse_response_head(b"HTTP/1.1 200 OK\r\nnotaheader\r\nx-ok: yes\r\n").unwrap();
        assert_eq!(resp.header_str("x-ok"), Some("yes"));
    }

    #[test]
    fn duplicate_header_keeps_last_value() {
        let resp =
            parse_response_head(b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: a=2\r\n").unwrap();
        assert_eq!(last_header_value(&resp.headers, "set-cookie"), Some("a=2"));
    }

    #[test]
    fn pending_events_priority_order() {
        let mut pending = PendingEvents { finished: true, failed: false, ..Default::default() };
        pending.body_chunk_available = true;
        pending.got_headers = true;
        assert_eq!(pending.highest_priority(), Some(Event::GotHeaders));
        pending.clear(Event::GotHeaders);
        assert_eq!(pending.highest_priority(), Some(Event::BodyChunkAvailable));
    }
}
