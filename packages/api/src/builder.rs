//! Fluent request construction. Chain header/body methods, then call a
//! terminal HTTP-verb method to enqueue the request against the [`Client`]
//! that produced the builder.

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use pullhttp_engine::bytestream::MemoryStream;
use pullhttp_engine::{IntoUrl, Request, RequestId, Result};

use crate::Client;

pub struct RequestBuilder<'a> {
    client: &'a mut Client,
    headers: HeaderMap,
    body: Option<(Box<dyn pullhttp_engine::bytestream::ReadableStream>, Option<u64>)>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a mut Client) -> Self {
        RequestBuilder { client, headers: HeaderMap::new(), body: None }
    }

    /// Adds a custom header, overwriting any prior value for the same name.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Merges `headers` in, without clearing whatever was set already.
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers {
            if let Some(name) = name {
                self.headers.insert(name, value);
            }
        }
        self
    }

    #[must_use]
    pub fn cache_control(self, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(v) => self.header(http::header::CACHE_CONTROL, v),
            Err(_) => self,
        }
    }

    #[must_use]
    pub fn user_agent(self, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(v) => self.header(http::header::USER_AGENT, v),
            Err(_) => self,
        }
    }

    #[must_use]
    pub fn bearer_auth(self, token: &str) -> Self {
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(v) => self.header(http::header::AUTHORIZATION, v),
            Err(_) => self,
        }
    }

    /// Sets the request body to `bytes`, with a known Content-Length.
    #[must_use]
    pub fn body_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        self.body = Some((Box::new(MemoryStream::new(bytes)), Some(len)));
        self
    }

    /// Sets the body to UTF-8 text, defaulting Content-Type to text/plain
    /// when the caller hasn't already set one.
    #[must_use]
    pub fn text_body(self, text: &str) -> Self {
        let builder = if !self.headers.contains_key(http::header::CONTENT_TYPE) {
            self.header(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        } else {
            self
        };
        builder.body_bytes(text.as_bytes().to_vec())
    }

    /// Serializes `value` as JSON and sets it as the body, defaulting
    /// Content-Type to application/json when the caller hasn't already set
    /// one. Serialization failure produces an empty body rather than
    /// propagating an error through the builder chain.
    #[must_use]
    pub fn json<T: serde::Serialize>(self, value: &T) -> Self {
        let builder = if !self.headers.contains_key(http::header::CONTENT_TYPE) {
            self.header(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        } else {
            self
        };
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        builder.body_bytes(bytes)
    }

    fn enqueue(self, method: Method, url: impl IntoUrl) -> Result<RequestId> {
        let mut headers = self.headers;
        if !headers.contains_key(http::header::USER_AGENT) {
            if let Ok(ua) = HeaderValue::from_str(&self.client.config().user_agent) {
                headers.insert(http::header::USER_AGENT, ua);
            }
        }
        let request = Request::new(method, url, headers, self.body)?;
        Ok(self.client.enqueue(request))
    }

    pub fn get(self, url: impl IntoUrl) -> Result<RequestId> {
        self.enqueue(Method::GET, url)
    }

    pub fn head(self, url: impl IntoUrl) -> Result<RequestId> {
        self.enqueue(Method::HEAD, url)
    }

    pub fn post(self, url: impl IntoUrl) -> Result<RequestId> {
        self.enqueue(Method::POST, url)
    }

    pub fn put(self, url: impl IntoUrl) -> Result<RequestId> {
        self.enqueue(Method::PUT, url)
    }

    pub fn patch(self, url: impl IntoUrl) -> Result<RequestId> {
        self.enqueue(Method::PATCH, url)
    }

    pub fn delete(self, url: impl IntoUrl) -> Result<RequestId> {
        self.enqueue(Method::DELETE, url)
    }
}
