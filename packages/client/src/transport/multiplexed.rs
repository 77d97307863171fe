//! The libcurl multi-handle transport: one `curl::easy::Easy2` per request,
//! driven cooperatively through a single `curl::multi::Multi` handle. This is the
//! "external multi handle" transport kind — curl owns the actual socket I/O;
//! this module's job is just mapping requests in and events out on each tick.

use std::collections::HashMap;
use std::time::Duration;

use curl::easy::{Easy2, Handler, List, ReadError, WriteError};
use curl::multi::{Easy2Handle, Multi};

use crate::bytestream::ReadableStream;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::model::{parse_response_head, Connection, RequestId, RequestState};
use crate::state::ClientState;
use crate::transport::{enforce_timeouts, Transport, TICK_POLL_BUDGET};

/// The `curl::easy::Handler` implementation backing each easy handle: buffers
/// header bytes until the blank line that ends the head, then forwards body
/// bytes straight into `body_buffer`. No decoding happens here — curl is told to
/// leave `Transfer-Encoding`/`Content-Encoding` alone via `transfer_decoding` /
/// `accept_encoding` rather than duplicating the engine's own decoder stack.
struct RequestHandler {
    header_buf: Vec<u8>,
    headers_done: bool,
    body_buffer: Vec<u8>,
    upload_body: Option<Box<dyn ReadableStream>>,
    parsed_response: Option<crate::model::Response>,
}

impl Handler for RequestHandler {
    fn write(&mut self, data: &[u8]) -> std::result::Result<usize, WriteError> {
        self.body_buffer.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        if data == b"\r\n" {
            self.headers_done = true;
            return true;
        }
        self.header_buf.extend_from_slice(data);
        true
    }

    fn read(&mut self, into: &mut [u8]) -> std::result::Result<usize, ReadError> {
        let Some(body) = self.upload_body.as_mut() else { return Ok(0) };
        match body.pull(into.len()) {
            Ok(0) if body.reached_end_of_data() => Ok(0),
            Ok(0) => Err(ReadError::Pause),
            Ok(n) => {
                let chunk = body.consume(n.min(into.len()));
                into[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            Err(_) => Err(ReadError::Abort),
        }
    }
}

struct CurlConnState {
    handle: Easy2Handle<RequestHandler>,
}

pub struct MultiplexedTransport {
    multi: Multi,
    /// curl token (assigned at `Multi::add2`) -> request id, since curl's
    /// completion messages only carry the token back.
    tokens: HashMap<usize, RequestId>,
    next_token: usize,
}

impl MultiplexedTransport {
    pub fn new() -> Result<Self> {
        Ok(MultiplexedTransport { multi: Multi::new(), tokens: HashMap::new(), next_token: 1 })
    }

    fn start(&mut self, id: RequestId, state: &mut ClientState, config: &ClientConfig) -> Result<()> {
        let req = state.request(id).ok_or_else(missing_request)?;
        if !matches!(req.url.scheme(), "http" | "https") {
            return Err(Error::InvalidScheme);
        }

        let mut easy = Easy2::new(RequestHandler {
            header_buf: Vec::new(),
            headers_done: false,
            body_buffer: Vec::new(),
            upload_body: None,
            parsed_response: None,
        });
        easy.url(req.url.as_str()).map_err(Error::connect_failure)?;
        easy.custom_request(req.method.as_str()).map_err(Error::connect_failure)?;
        easy.follow_location(false).map_err(Error::connect_failure)?;
        easy.timeout(Duration::from_millis(config.timeout_ms)).map_err(Error::connect_failure)?;
        easy.useragent(&config.user_agent).map_err(Error::connect_failure)?;

        let mut headers = List::new();
        for (name, value) in req.headers.iter() {
            let line = format!("{}: {}", name.as_str(), value.to_str().unwrap_or_default());
            headers.append(&line).map_err(Error::connect_failure)?;
        }
        easy.http_headers(headers).map_err(Error::connect_failure)?;

        let has_body = req.upload_body.is_some();
        if has_body {
            easy.upload(true).map_err(Error::connect_failure)?;
        } else if req.method == http::Method::HEAD {
            easy.nobody(true).map_err(Error::connect_failure)?;
        }

        let token = self.next_token;
        self.next_token += 1;

        let mut handle = self.multi.add2(easy).map_err(Error::connect_failure)?;
        handle.set_token(token).map_err(Error::connect_failure)?;
        self.tokens.insert(token, id);

        tracing::trace!(request_id = id, "curl easy handle added to multi");
        let req = state.request_mut(id).ok_or_else(missing_request)?;
        req.started_at = Some(std::time::Instant::now());
        tracing::debug!(request_id = id, to = ?RequestState::WillSendHeaders, "state transition");
        req.state = RequestState::WillSendHeaders;
        if has_body {
            handle.get_mut().upload_body = req.upload_body.take();
        }

        state.insert_connection(Connection::new(id, Box::new(CurlConnState { handle })));
        Ok(())
    }

    fn poll_results(&mut self, state: &mut ClientState) -> Result<bool> {
        let mut progressed = false;
        let tokens = &self.tokens;
        self.multi.messages(|message| {
            let Some(token) = message.token().ok() else { return };
            let Some(&id) = tokens.get(&token) else { return };
            if let Some(result) = message.result() {
                progressed = true;
                if let Err(e) = finish_request(id, result, state) {
                    tracing::warn!(request_id = id, error = %e, "request failed");
                    if let Some(req) = state.request_mut(id) {
                        req.fail(e);
                    }
                    state.pending_mut(id).failed = true;
                }
            }
        });
        Ok(progressed)
    }
}

fn missing_request() -> Error {
    Error::ConnectFailure { message: "missing request".into() }
}

fn finish_request(id: RequestId, result: std::result::Result<(), curl::Error>, state: &mut ClientState) -> Result<()> {
    let Some(connection) = state.connection_mut(id) else { return Ok(()) };
    let conn = connection
        .handle
        .downcast_mut::<CurlConnState>()
        .ok_or_else(|| Error::ConnectFailure { message: "wrong connection kind".into() })?;

    if let Err(e) = result {
        return Err(Error::TransportError { code: e.code() as i32, message: e.description().to_string() });
    }

    let handler = conn.handle.get_ref();
    if !handler.headers_done || handler.header_buf.is_empty() {
        return Err(Error::ConnectionClosedBeforeHeaders);
    }
    let response = parse_response_head(&handler.header_buf)?;
    let body = handler.body_buffer.clone();

    tracing::trace!(request_id = id, bytes = body.len(), "body decoded");
    let req = state.request_mut(id).ok_or_else(missing_request)?;
    req.response = Some(response);
    tracing::debug!(request_id = id, to = ?RequestState::Received, "state transition");
    req.state = RequestState::Received;

    let connection = state.connection_mut(id).ok_or_else(missing_request)?;
    connection.body_buffer = body;

    state.pending_mut(id).got_headers = true;
    state.pending_mut(id).body_chunk_available = !state.connection(id).unwrap().body_buffer.is_empty();
    state.pending_mut(id).finished = true;
    Ok(())
}

impl Transport for MultiplexedTransport {
    fn event_loop_tick(&mut self, state: &mut ClientState, config: &ClientConfig) -> Result<bool> {
        let mut progressed = enforce_timeouts(state, config);

        for id in state.active_slice() {
            let needs_start = state.connection(id).is_none()
                && state.request(id).is_some_and(|r| r.state == RequestState::Enqueued);
            if !needs_start {
                continue;
            }
            if let Err(e) = self.start(id, state, config) {
                tracing::warn!(request_id = id, error = %e, "request failed");
                if let Some(req) = state.request_mut(id) {
                    req.fail(e);
                }
                state.pending_mut(id).failed = true;
            }
            progressed = true;
        }

        self.multi.perform().map_err(Error::connect_failure)?;
        self.multi.poll(&mut [], TICK_POLL_BUDGET).map_err(Error::connect_failure)?;

        progressed |= self.poll_results(state)?;

        let finished: Vec<RequestId> = state
            .requests_in_states(Some(&[RequestState::Received, RequestState::Failed]))
            .into_iter()
            .filter(|id| state.connection(*id).is_some())
            .collect();
        for id in finished {
            if let Some(connection) = state.release_connection(id) {
                if let Ok(conn) = connection.handle.downcast::<CurlConnState>() {
                    let _ = self.multi.remove2(conn.handle);
                }
            }
        }

        Ok(progressed)
    }
}
