//! RFC 7234-style freshness arithmetic over a stored `CacheRecord`.

use crate::cache::entry::CacheRecord;

/// `s-maxage` wins over `max-age`; lacking either, a heuristic lifetime of 10%
/// of the age the response already had at `Last-Modified` time is used, the
/// same fallback most caches apply when a server sends no explicit lifetime.
pub fn freshness_lifetime_ms(record: &CacheRecord) -> Option<u64> {
    if let Some(s) = record.s_maxage {
        return Some(s * 1000);
    }
    if let Some(m) = record.max_age {
        return Some(m * 1000);
    }
    if record.must_revalidate {
        return Some(0);
    }
    let last_modified_ms = record.last_modified.as_deref().and_then(parse_http_date_ms)?;
    let age = record.stored_at_ms.saturating_sub(last_modified_ms);
    Some(age / 10)
}

pub fn is_fresh(record: &CacheRecord, now_ms: u64) -> bool {
    let Some(lifetime) = freshness_lifetime_ms(record) else { return false };
    now_ms.saturating_sub(record.stored_at_ms) < lifetime
}

fn parse_http_date_ms(value: &str) -> Option<u64> {
    let date = httpdate::parse_http_date(value).ok()?;
    let ms = date.duration_since(std::time::UNIX_EPOCH).ok()?.as_millis();
    Some(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(max_age: Option<u64>, stored_at_ms: u64) -> CacheRecord {
        CacheRecord {
            url: "http://example.com/".into(),
            status: 200,
            status_message: None,
            headers: Vec::new(),
            stored_at_ms,
            etag: None,
            last_modified: None,
            max_age,
            s_maxage: None,
            must_revalidate: false,
            vary: Vec::new(),
        }
    }

    #[test]
    fn fresh_within_max_age() {
        let r = record(Some(60), 1_000_000);
        assert!(is_fresh(&r, 1_000_000 + 30_000));
    }

    #[test]
    fn stale_past_max_age() {
        let r = record(Some(60), 1_000_000);
        assert!(!is_fresh(&r, 1_000_000 + 90_000));
    }

    #[test]
    fn no_lifetime_information_is_never_fresh() {
        let r = record(None, 1_000_000);
        assert!(!is_fresh(&r, 1_000_000 + 1));
    }

    #[test]
    fn s_maxage_takes_priority_over_max_age() {
        let mut r = record(Some(5), 1_000_000);
        r.s_maxage = Some(3600);
        assert!(is_fresh(&r, 1_000_000 + 10_000));
    }

    #[test]
    fn must_revalidate_without_explicit_lifetime_is_never_fresh() {
        let mut r = record(None, 1_000_000);
        r.must_revalidate = true;
        r.last_modified = Some("Mon, 01 Jan 1990 00:00:00 GMT".into());
        assert_eq!(freshness_lifetime_ms(&r), Some(0));
        assert!(!is_fresh(&r, 1_000_000));
    }
}
