//! Error taxonomy for the pullhttp engine.
//!
//! One variant per error kind named in the core's error-handling design: the first
//! error observed on a Request transitions it to FAILED and no further events are
//! emitted for that Request.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid URL scheme (only http and https are accepted)")]
    InvalidScheme,

    #[error("invalid URL: {message}")]
    InvalidUrl { message: String },

    #[error("connect failed: {message}")]
    ConnectFailure { message: String },

    #[error("TLS handshake failed: {message}")]
    TlsFailure { message: String },

    #[error("failed to write request bytes: {message}")]
    WriteFailure { message: String },

    #[error("connection closed before headers were received")]
    ConnectionClosedBeforeHeaders,

    #[error("malformed response headers: {message}")]
    MalformedHeaders { message: String },

    #[error("unsupported encoding: {encoding}")]
    UnsupportedEncoding { encoding: String },

    #[error("malformed chunked transfer-encoding framing")]
    MalformedChunk,

    #[error("decoder reported invalid input: {message}")]
    DecodeError { message: String },

    #[error("request timed out")]
    Timeout,

    #[error("too many redirects (max_redirects exceeded)")]
    TooManyRedirects,

    #[error("invalid redirect URL: {message}")]
    InvalidRedirectUrl { message: String },

    #[error("cannot replay a non-restartable upload body across this redirect")]
    UnreplayableBody,

    #[error("transport error {code}: {message}")]
    TransportError { code: i32, message: String },
}

impl Error {
    pub fn invalid_url(e: impl fmt::Display) -> Self {
        Error::InvalidUrl { message: e.to_string() }
    }

    pub fn malformed_headers(e: impl fmt::Display) -> Self {
        Error::MalformedHeaders { message: e.to_string() }
    }

    pub fn connect_failure(e: impl fmt::Display) -> Self {
        Error::ConnectFailure { message: e.to_string() }
    }

    pub fn tls_failure(e: impl fmt::Display) -> Self {
        Error::TlsFailure { message: e.to_string() }
    }

    pub fn write_failure(e: impl fmt::Display) -> Self {
        Error::WriteFailure { message: e.to_string() }
    }

    pub fn decode_error(e: impl fmt::Display) -> Self {
        Error::DecodeError { message: e.to_string() }
    }

    pub fn invalid_redirect_url(url: &str, e: impl fmt::Display) -> Self {
        Error::InvalidRedirectUrl { message: format!("{url}: {e}") }
    }

    /// True for errors the consumer may reasonably retry (connect/write/timeout
    /// failures); false for protocol or policy violations.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailure { .. }
                | Error::TlsFailure { .. }
                | Error::WriteFailure { .. }
                | Error::Timeout
                | Error::ConnectionClosedBeforeHeaders
        )
    }
}
