//! Cache file naming: `<sha1(url)>_<variant>.json` / `.body`, where `variant`
//! folds in whichever request headers the stored response's `Vary` named.

use sha1::{Digest, Sha1};

pub fn url_hash(url: &str) -> String {
    hex(&Sha1::digest(url.as_bytes()))
}

/// The common case (no `Vary`, or no cached variant index yet) uses the fixed
/// key `"default"` so a plain GET never pays for a hash it doesn't need.
pub fn variant_key(vary_names: &[String], headers: &http::HeaderMap) -> String {
    if vary_names.is_empty() {
        return "default".to_string();
    }
    let mut hasher = Sha1::new();
    for name in vary_names {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        if let Some(value) = headers.get(name.as_str()) {
            hasher.update(value.as_bytes());
        }
        hasher.update([0u8]);
    }
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_vary_names_uses_default_key() {
        assert_eq!(variant_key(&[], &http::HeaderMap::new()), "default");
    }

    #[test]
    fn differing_vary_header_values_produce_different_keys() {
        let names = vec!["accept-encoding".to_string()];
        let mut a = http::HeaderMap::new();
        a.insert("accept-encoding", http::HeaderValue::from_static("gzip"));
        let mut b = http::HeaderMap::new();
        b.insert("accept-encoding", http::HeaderValue::from_static("identity"));
        assert_ne!(variant_key(&names, &a), variant_key(&names, &b));
    }

    #[test]
    fn url_hash_is_stable() {
        assert_eq!(url_hash("http://example.com/"), url_hash("http://example.com/"));
        assert_ne!(url_hash("http://example.com/a"), url_hash("http://example.com/b"));
    }
}
