//! The self-contained, non-blocking TCP(+TLS) transport.
//!
//! Connects directly with `mio`, steps a `rustls` handshake across ticks for
//! `https`, and parses the response head itself. Only `http` and `https` schemes
//! are accepted. There is no connection reuse: every request gets its own socket
//! and `Connection: close` is always sent, matching the upload and download paths
//! being driven purely by `pull`/`peek`/`consume` rather than a background reader
//! thread.

use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::bytestream::{ChunkedDecoder, ContentCoding, GrowableStream, Inflate, ReadableStream};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::model::{parse_response_head, Connection, Request, RequestId, RequestState};
use crate::state::ClientState;
use crate::transport::{enforce_timeouts, Transport, TICK_POLL_BUDGET};

enum Phase {
    Connecting,
    TlsHandshake,
    SendingHeaders,
    SendingBody,
    ReceivingHeaders,
    ReceivingBody,
    Done,
}

/// The decoder stack selected once the response headers are known. Kept as an
/// enum over concrete types rather than `Box<dyn ReadableStream>` so the
/// transport can keep feeding it new wire bytes every tick through an inherent
/// method the trait doesn't expose.
enum BodyDecoder {
    Identity(GrowableStream),
    Chunked(ChunkedDecoder<GrowableStream>),
    Inflate(Inflate<GrowableStream>),
    ChunkedInflate(Inflate<ChunkedDecoder<GrowableStream>>),
}

impl BodyDecoder {
    fn new(chunked: bool, coding: ContentCoding) -> Self {
        match (chunked, coding) {
            (false, ContentCoding::Identity) => BodyDecoder::Identity(GrowableStream::new()),
            (true, ContentCoding::Identity) => BodyDecoder::Chunked(ChunkedDecoder::new(GrowableStream::new())),
            (false, coding) => BodyDecoder::Inflate(Inflate::new(GrowableStream::new(), coding)),
            (true, coding) => {
                BodyDecoder::ChunkedInflate(Inflate::new(ChunkedDecoder::new(GrowableStream::new()), coding))
            }
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        match self {
            BodyDecoder::Identity(s) => s.feed(bytes),
            BodyDecoder::Chunked(d) => d.inner_mut().feed(bytes),
            BodyDecoder::Inflate(d) => d.inner_mut().feed(bytes),
            BodyDecoder::ChunkedInflate(d) => d.inner_mut().inner_mut().feed(bytes),
        }
    }

    fn mark_eof(&mut self) {
        match self {
            BodyDecoder::Identity(s) => s.mark_eof(),
            BodyDecoder::Chunked(d) => d.inner_mut().mark_eof(),
            BodyDecoder::Inflate(d) => d.inner_mut().mark_eof(),
            BodyDecoder::ChunkedInflate(d) => d.inner_mut().inner_mut().mark_eof(),
        }
    }

    fn pull_and_take(&mut self) -> Result<Vec<u8>> {
        let n = match self {
            BodyDecoder::Identity(s) => s.pull(usize::MAX)?,
            BodyDecoder::Chunked(d) => d.pull(64 * 1024)?,
            BodyDecoder::Inflate(d) => d.pull(64 * 1024)?,
            BodyDecoder::ChunkedInflate(d) => d.pull(64 * 1024)?,
        };
        if n == 0 {
            return Ok(Vec::new());
        }
        Ok(match self {
            BodyDecoder::Identity(s) => s.consume(n),
            BodyDecoder::Chunked(d) => d.consume(n),
            BodyDecoder::Inflate(d) => d.consume(n),
            BodyDecoder::ChunkedInflate(d) => d.consume(n),
        })
    }

    fn reached_end_of_data(&self) -> bool {
        match self {
            BodyDecoder::Identity(s) => s.reached_end_of_data(),
            BodyDecoder::Chunked(d) => d.reached_end_of_data(),
            BodyDecoder::Inflate(d) => d.reached_end_of_data(),
            BodyDecoder::ChunkedInflate(d) => d.reached_end_of_data(),
        }
    }
}

enum ChunkedUpload {
    Identity,
    Chunked,
}

struct SocketConnState {
    stream: MioTcpStream,
    tls: Option<rustls::ClientConnection>,
    registered: bool,
    phase: Phase,
    write_buf: Vec<u8>,
    write_pos: usize,
    upload: Option<ChunkedUpload>,
    header_buf: Vec<u8>,
    body: Option<BodyDecoder>,
}

pub struct SocketTransport {
    poll: Poll,
    events: Events,
    tls_config: Arc<rustls::ClientConfig>,
}

impl SocketTransport {
    pub fn new() -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(SocketTransport {
            poll: Poll::new().map_err(Error::connect_failure)?,
            events: Events::with_capacity(256),
            tls_config: Arc::new(tls_config),
        })
    }

    fn start_connection(&mut self, id: RequestId, state: &mut ClientState) -> Result<()> {
        let req = state.request(id).ok_or_else(missing_request)?;
        if !matches!(req.url.scheme(), "http" | "https") {
            return Err(Error::InvalidScheme);
        }
        let https = req.url.scheme() == "https";
        let host = req.url.host_str().ok_or(Error::InvalidScheme)?.to_string();
        let port = req.url.port_or_known_default().unwrap_or(if https { 443 } else { 80 });

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(Error::connect_failure)?
            .next()
            .ok_or_else(|| Error::ConnectFailure { message: format!("no addresses for {host}") })?;

        let std_stream = std::net::TcpStream::connect(addr).map_err(Error::connect_failure)?;
        std_stream.set_nonblocking(true).map_err(Error::connect_failure)?;
        let stream = MioTcpStream::from_std(std_stream);

        let tls = if https {
            let server_name =
                rustls::pki_types::ServerName::try_from(host.clone()).map_err(Error::tls_failure)?;
            Some(rustls::ClientConnection::new(self.tls_config.clone(), server_name).map_err(Error::tls_failure)?)
        } else {
            None
        };

        let conn_state = SocketConnState {
            stream,
            tls,
            registered: false,
            phase: if https { Phase::TlsHandshake } else { Phase::Connecting },
            write_buf: Vec::new(),
            write_pos: 0,
            upload: None,
            header_buf: Vec::new(),
            body: None,
        };

        tracing::trace!(request_id = id, %addr, https, "connecting");
        state.insert_connection(Connection::new(id, Box::new(conn_state)));
        if let Some(req) = state.request_mut(id) {
            req.started_at = Some(Instant::now());
            let next = if https { RequestState::WillEnableCrypto } else { RequestState::WillSendHeaders };
            tracing::debug!(request_id = id, from = ?req.state, to = ?next, "state transition");
            req.state = next;
        }
        Ok(())
    }

    fn register(&mut self, token: Token, conn: &mut SocketConnState) -> Result<()> {
        if !conn.registered {
            self.poll
                .registry()
                .register(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE)
                .map_err(Error::connect_failure)?;
            conn.registered = true;
        }
        Ok(())
    }

    fn drive_one(&mut self, id: RequestId, state: &mut ClientState) -> Result<bool> {
        let Some(mut connection) = state.release_connection(id) else { return Ok(false) };
        let result = self.step(id, &mut connection, state);
        state.insert_connection(connection);
        result
    }

    fn step(&mut self, id: RequestId, connection: &mut Connection, state: &mut ClientState) -> Result<bool> {
        let conn = connection
            .handle
            .downcast_mut::<SocketConnState>()
            .ok_or_else(|| Error::ConnectFailure { message: "wrong connection kind".into() })?;
        self.register(Token(id as usize), conn)?;

        match conn.phase {
            Phase::Connecting => {
                if conn.stream.take_error().map_err(Error::connect_failure)?.is_some() {
                    return Err(Error::ConnectFailure { message: "connect failed".into() });
                }
                tracing::trace!(request_id = id, "tcp connected");
                conn.phase = Phase::SendingHeaders;
                tracing::debug!(request_id = id, to = ?RequestState::WillSendHeaders, "state transition");
                state.request_mut(id).ok_or_else(missing_request)?.state = RequestState::WillSendHeaders;
                Ok(true)
            }
            Phase::TlsHandshake => {
                let progressed = step_tls(conn)?;
                if progressed {
                    tracing::trace!(request_id = id, "tls handshake step");
                }
                if conn.tls.as_ref().is_some_and(|t| !t.is_handshaking()) {
                    conn.phase = Phase::SendingHeaders;
                    tracing::debug!(request_id = id, to = ?RequestState::WillSendHeaders, "state transition");
                    state.request_mut(id).ok_or_else(missing_request)?.state = RequestState::WillSendHeaders;
                    return Ok(true);
                }
                Ok(progressed)
            }
            Phase::SendingHeaders => step_send_headers(conn, state, id),
            Phase::SendingBody => step_upload(conn, state, id),
            Phase::ReceivingHeaders => step_receive_headers(conn, state, id),
            Phase::ReceivingBody => step_receive_body(connection, state, id),
            Phase::Done => Ok(false),
        }
    }
}

fn missing_request() -> Error {
    Error::ConnectFailure { message: "missing request".into() }
}

fn step_tls(conn: &mut SocketConnState) -> Result<bool> {
    let Some(tls) = conn.tls.as_mut() else { return Ok(false) };
    let mut progressed = false;
    if tls.wants_write() {
        match tls.write_tls(&mut conn.stream) {
            Ok(n) => progressed |= n > 0,
            Err(e) if would_block(&e) => {}
            Err(e) => return Err(Error::tls_failure(e)),
        }
    }
    if tls.wants_read() {
        match tls.read_tls(&mut conn.stream) {
            Ok(0) => return Err(Error::ConnectionClosedBeforeHeaders),
            Ok(_) => {
                tls.process_new_packets().map_err(Error::tls_failure)?;
                progressed = true;
            }
            Err(e) if would_block(&e) => {}
            Err(e) => return Err(Error::tls_failure(e)),
        }
    }
    Ok(progressed)
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn write_plain_or_tls(conn: &mut SocketConnState, bytes: &[u8]) -> Result<usize> {
    if let Some(tls) = conn.tls.as_mut() {
        let n = tls.writer().write(bytes).map_err(Error::write_failure)?;
        let _ = tls.write_tls(&mut conn.stream);
        Ok(n)
    } else {
        match conn.stream.write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(Error::write_failure(e)),
        }
    }
}

/// Reads whatever plaintext bytes are available right now. For TLS this may
/// require pumping several inbound TLS records before any plaintext is ready,
/// which is done inline rather than waiting for a further poll wakeup.
fn read_plain_or_tls(conn: &mut SocketConnState, buf: &mut [u8]) -> Result<usize> {
    if let Some(tls) = conn.tls.as_mut() {
        loop {
            match tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => match tls.read_tls(&mut conn.stream) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {
                        tls.process_new_packets().map_err(Error::tls_failure)?;
                        continue;
                    }
                    Err(e) if would_block(&e) => return Ok(0),
                    Err(e) => return Err(Error::tls_failure(e)),
                },
                Err(e) => return Err(Error::write_failure(e)),
            }
        }
    } else {
        match conn.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(Error::write_failure(e)),
        }
    }
}

fn step_send_headers(conn: &mut SocketConnState, state: &mut ClientState, id: RequestId) -> Result<bool> {
    if conn.write_buf.is_empty() {
        let req = state.request(id).ok_or_else(missing_request)?;
        conn.write_buf = assemble_request_head(req);
        conn.write_pos = 0;
    }
    let remaining = conn.write_buf[conn.write_pos..].to_vec();
    let written = write_plain_or_tls(conn, &remaining)?;
    conn.write_pos += written;
    if conn.write_pos < conn.write_buf.len() {
        return Ok(written > 0);
    }

    conn.write_buf.clear();
    tracing::trace!(request_id = id, "request head sent");
    let req = state.request_mut(id).ok_or_else(missing_request)?;
    let has_body = req.upload_body.is_some();
    if has_body {
        let chunked = !req.headers.contains_key(http::header::CONTENT_LENGTH);
        conn.upload = Some(if chunked { ChunkedUpload::Chunked } else { ChunkedUpload::Identity });
        tracing::debug!(request_id = id, to = ?RequestState::WillSendBody, "state transition");
        req.state = RequestState::WillSendBody;
        conn.phase = Phase::SendingBody;
    } else {
        tracing::debug!(request_id = id, to = ?RequestState::Sent, "state transition");
        req.state = RequestState::Sent;
        conn.phase = Phase::ReceivingHeaders;
    }
    Ok(true)
}

fn step_upload(conn: &mut SocketConnState, state: &mut ClientState, id: RequestId) -> Result<bool> {
    let req = state.request_mut(id).ok_or_else(missing_request)?;
    let Some(body) = req.upload_body.as_mut() else {
        conn.phase = Phase::ReceivingHeaders;
        req.state = RequestState::Sent;
        return Ok(true);
    };

    let pulled = body.pull(64 * 1024)?;
    if pulled > 0 {
        req.upload_body_consumed = true;
        let chunk = body.consume(pulled);
        let framed = match conn.upload {
            Some(ChunkedUpload::Chunked) => {
                let mut out = format!("{:x}\r\n", chunk.len()).into_bytes();
                out.extend_from_slice(&chunk);
                out.extend_from_slice(b"\r\n");
                out
            }
            _ => chunk,
        };
        write_plain_or_tls(conn, &framed)?;
        return Ok(true);
    }
    if body.reached_end_of_data() {
        if matches!(conn.upload, Some(ChunkedUpload::Chunked)) {
            write_plain_or_tls(conn, b"0\r\n\r\n")?;
        }
        conn.phase = Phase::ReceivingHeaders;
        tracing::debug!(request_id = id, to = ?RequestState::Sent, "state transition");
        req.state = RequestState::Sent;
        return Ok(true);
    }
    Ok(false)
}

fn step_receive_headers(conn: &mut SocketConnState, state: &mut ClientState, id: RequestId) -> Result<bool> {
    let mut buf = [0u8; 8192];
    let n = read_plain_or_tls(conn, &mut buf)?;
    if n == 0 {
        return Ok(false);
    }
    conn.header_buf.extend_from_slice(&buf[..n]);
    tracing::trace!(request_id = id, bytes = n, "header bytes available");

    let Some(head_end) = find_double_crlf(&conn.header_buf) else { return Ok(true) };
    let head = conn.header_buf[..head_end].to_vec();
    let leftover = conn.header_buf.split_off(head_end + 4);
    conn.header_buf.clear();

    let response = parse_response_head(&head)?;
    let is_head = state.request(id).ok_or_else(missing_request)?.method == http::Method::HEAD;

    let transfer_encoding = response.header_str("transfer-encoding").map(str::to_ascii_lowercase);
    if let Some(te) = &transfer_encoding {
        if te != "chunked" && te != "identity" {
            return Err(Error::UnsupportedEncoding { encoding: te.clone() });
        }
    }
    let chunked = transfer_encoding.as_deref() == Some("chunked");
    let coding = match response.header_str("content-encoding") {
        Some(v) => ContentCoding::parse(v)?,
        None => ContentCoding::Identity,
    };

    let no_body = is_head || matches!(response.status, 204 | 304) || response.total_bytes == Some(0);

    let mut decoder = BodyDecoder::new(chunked, coding);
    decoder.feed(&leftover);

    state.request_mut(id).ok_or_else(missing_request)?.response = Some(response);
    state.pending_mut(id).got_headers = true;

    if no_body {
        decoder.mark_eof();
        tracing::debug!(request_id = id, to = ?RequestState::Received, "state transition");
        state.request_mut(id).ok_or_else(missing_request)?.state = RequestState::Received;
        state.pending_mut(id).finished = true;
        conn.phase = Phase::Done;
    } else {
        tracing::debug!(request_id = id, to = ?RequestState::ReceivingBody, "state transition");
        state.request_mut(id).ok_or_else(missing_request)?.state = RequestState::ReceivingBody;
        conn.phase = Phase::ReceivingBody;
    }
    conn.body = Some(decoder);
    Ok(true)
}

fn step_receive_body(
    connection: &mut Connection,
    state: &mut ClientState,
    id: RequestId,
) -> Result<bool> {
    let conn = connection
        .handle
        .downcast_mut::<SocketConnState>()
        .ok_or_else(|| Error::ConnectFailure { message: "wrong connection kind".into() })?;
    let mut buf = [0u8; 64 * 1024];
    let n = read_plain_or_tls(conn, &mut buf)?;
    let decoder = conn.body.as_mut().ok_or_else(missing_request)?;
    if n > 0 {
        decoder.feed(&buf[..n]);
    } else {
        decoder.mark_eof();
    }

    let decoded = decoder.pull_and_take()?;
    let mut progressed = !decoded.is_empty();
    if !decoded.is_empty() {
        tracing::trace!(request_id = id, bytes = decoded.len(), "body chunk decoded");
        if let Some(req) = state.request_mut(id) {
            if let Some(resp) = req.response.as_mut() {
                resp.received_bytes += decoded.len() as u64;
            }
        }
        connection.body_buffer.extend_from_slice(&decoded);
        state.pending_mut(id).body_chunk_available = true;
    }

    if decoder.reached_end_of_data() {
        tracing::debug!(request_id = id, to = ?RequestState::Received, "state transition");
        if let Some(req) = state.request_mut(id) {
            req.state = RequestState::Received;
        }
        state.pending_mut(id).finished = true;
        conn.phase = Phase::Done;
        progressed = true;
    }
    Ok(progressed)
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Builds the CRLF-delimited request line + header block. `Accept-Encoding: gzip`
/// is added automatically unless the caller set Range or Accept-Encoding
/// themselves, since compression and byte ranges interact unpredictably across
/// servers.
fn assemble_request_head(req: &Request) -> Vec<u8> {
    let mut path = req.url.path().to_string();
    if let Some(q) = req.url.query() {
        path.push('?');
        path.push_str(q);
    }
    let mut out = format!("{} {} {}\r\n", req.method, path, req.version).into_bytes();

    let mut headers = req.headers.clone();
    if !headers.contains_key(http::header::RANGE) && !headers.contains_key(http::header::ACCEPT_ENCODING) {
        headers.insert(http::header::ACCEPT_ENCODING, http::HeaderValue::from_static("gzip"));
    }
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

impl Transport for SocketTransport {
    fn event_loop_tick(&mut self, state: &mut ClientState, config: &ClientConfig) -> Result<bool> {
        let mut progressed = enforce_timeouts(state, config);

        for id in state.active_slice() {
            let needs_connection = state.connection(id).is_none()
                && state.request(id).is_some_and(|r| r.state == RequestState::Enqueued);
            if !needs_connection {
                continue;
            }
            if let Err(e) = self.start_connection(id, state) {
                tracing::warn!(request_id = id, url = %state.request(id).map(|r| r.url.as_str()).unwrap_or_default(), error = %e, "request failed");
                if let Some(req) = state.request_mut(id) {
                    req.fail(e);
                }
                state.pending_mut(id).failed = true;
            }
            progressed = true;
        }

        let _ = self.poll.poll(&mut self.events, Some(TICK_POLL_BUDGET));

        for id in state.active_slice() {
            if state.connection(id).is_none() {
                continue;
            }
            match self.drive_one(id, state) {
                Ok(made_progress) => progressed |= made_progress,
                Err(e) => {
                    tracing::warn!(request_id = id, url = %state.request(id).map(|r| r.url.as_str()).unwrap_or_default(), error = %e, "request failed");
                    if let Some(req) = state.request_mut(id) {
                        req.fail(e);
                    }
                    state.pending_mut(id).failed = true;
                    state.release_connection(id);
                    progressed = true;
                }
            }
        }

        let finished: Vec<RequestId> = state
            .requests_in_states(Some(&[RequestState::Received, RequestState::Failed]))
            .into_iter()
            .filter(|id| state.connection(*id).is_some())
            .collect();
        for id in finished {
            state.release_connection(id);
        }

        Ok(progressed)
    }
}
