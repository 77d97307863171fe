//! The on-disk cache metadata record and the Cache-Control/validator fields
//! pulled out of a response at store time.

use std::time::{SystemTime, UNIX_EPOCH};

use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::model::Response;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub url: String,
    pub status: u16,
    pub status_message: Option<String>,
    pub headers: Vec<(String, String)>,
    pub stored_at_ms: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub must_revalidate: bool,
    pub vary: Vec<String>,
}

impl CacheRecord {
    pub fn from_response(url: &str, response: &Response) -> Self {
        let cache_control = response.header_str("cache-control").unwrap_or_default();
        let directive_value = |name: &str| -> Option<u64> {
            cache_control.split(',').find_map(|d| {
                let (key, value) = d.trim().split_once('=')?;
                key.eq_ignore_ascii_case(name).then(|| value.trim_matches('"').parse().ok()).flatten()
            })
        };
        let has_directive = |name: &str| cache_control.split(',').any(|d| d.trim().eq_ignore_ascii_case(name));

        let vary = response
            .header_str("vary")
            .map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()).collect())
            .unwrap_or_default();

        CacheRecord {
            url: url.to_string(),
            status: response.status,
            status_message: response.status_message.clone(),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.to_str().unwrap_or_default().to_string()))
                .collect(),
            stored_at_ms: now_ms(),
            etag: response.header_str("etag").map(str::to_string),
            last_modified: response.header_str("last-modified").map(str::to_string),
            max_age: directive_value("max-age"),
            s_maxage: directive_value("s-maxage"),
            must_revalidate: has_directive("must-revalidate") || has_directive("proxy-revalidate"),
            vary,
        }
    }

    pub fn is_no_store(response: &Response) -> bool {
        response
            .header_str("cache-control")
            .map(|v| v.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-store")))
            .unwrap_or(false)
    }

    /// `Vary: *` means the response varies on something outside any header a
    /// future request could repeat, so it must never be stored at all.
    pub fn has_vary_star(response: &Response) -> bool {
        response.header_str("vary").map(|v| v.split(',').any(|d| d.trim() == "*")).unwrap_or(false)
    }

    pub fn is_cacheable_status(status: u16) -> bool {
        matches!(status, 200 | 203 | 204 | 206 | 300 | 301 | 404 | 405 | 410 | 414 | 501)
    }

    pub fn to_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) =
                (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
            {
                headers.append(name, value);
            }
        }
        headers
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap as HttpHeaderMap;

    fn response_with(headers: &[(&str, &str)], status: u16) -> Response {
        let mut map = HttpHeaderMap::new();
        for (k, v) in headers {
            map.insert(HeaderName::from_bytes(k.as_bytes()).unwrap(), HeaderValue::from_str(v).unwrap());
        }
        Response { protocol: "HTTP/1.1".into(), status, status_message: None, headers: map, received_bytes: 0, total_bytes: None }
    }

    #[test]
    fn extracts_max_age_and_etag() {
        let resp = response_with(&[("cache-control", "max-age=60"), ("etag", "\"abc\"")], 200);
        let record = CacheRecord::from_response("http://example.com/", &resp);
        assert_eq!(record.max_age, Some(60));
        assert_eq!(record.etag.as_deref(), Some("\"abc\""));
        assert!(!record.must_revalidate);
    }

    #[test]
    fn detects_must_revalidate_and_vary() {
        let resp = response_with(&[("cache-control", "must-revalidate"), ("vary", "Accept-Encoding, X-Flag")], 200);
        let record = CacheRecord::from_response("http://example.com/", &resp);
        assert!(record.must_revalidate);
        assert_eq!(record.vary, vec!["accept-encoding".to_string(), "x-flag".to_string()]);
    }

    #[test]
    fn detects_no_store() {
        let resp = response_with(&[("cache-control", "no-store")], 200);
        assert!(CacheRecord::is_no_store(&resp));
    }

    #[test]
    fn detects_vary_star() {
        let resp = response_with(&[("vary", "*")], 200);
        assert!(CacheRecord::has_vary_star(&resp));

        let resp = response_with(&[("vary", "Accept-Encoding")], 200);
        assert!(!CacheRecord::has_vary_star(&resp));
    }
}
