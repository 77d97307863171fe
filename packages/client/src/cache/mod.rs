//! The disk-backed HTTP cache: a metadata record (`.json`) plus a body blob
//! (`.body`) per cached representation, written atomically via a `.tmp`
//! staging file and a rename.

mod entry;
mod freshness;
mod key;

pub use entry::CacheRecord;
pub use freshness::is_fresh;
pub use key::{url_hash, variant_key};

use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CacheStore { dir: dir.into() }
    }

    fn paths(&self, url: &str, variant: &str) -> (PathBuf, PathBuf, PathBuf) {
        let stem = format!("{}_{}", url_hash(url), variant);
        (
            self.dir.join(format!("{stem}.json")),
            self.dir.join(format!("{stem}.body")),
            self.dir.join(format!("{stem}.tmp")),
        )
    }

    fn vary_names_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.vary", url_hash(url)))
    }

    fn known_vary_names(&self, url: &str) -> Vec<String> {
        fs::read_to_string(self.vary_names_path(url))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Looks up whatever variant of `url` matches `headers` against the last
    /// known `Vary` header list for that URL. Any I/O or parse failure is
    /// treated as a plain cache miss.
    pub fn load(&self, url: &str, headers: &http::HeaderMap) -> Option<(CacheRecord, Vec<u8>)> {
        let variant = variant_key(&self.known_vary_names(url), headers);
        let (meta_path, body_path, _) = self.paths(url, &variant);
        let record: CacheRecord = serde_json::from_slice(&fs::read(meta_path).ok()?).ok()?;
        let body = fs::read(body_path).ok()?;
        Some((record, body))
    }

    /// Stores `record`/`body` for the representation of `url` that `headers`
    /// (the request that produced it) selects. The body is staged at `.tmp`
    /// and renamed into place so a crash mid-write never leaves a truncated
    /// `.body` file behind.
    pub fn store(&self, url: &str, headers: &http::HeaderMap, record: &CacheRecord, body: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(Error::connect_failure)?;
        if !record.vary.is_empty() {
            fs::write(self.vary_names_path(url), record.vary.join("\n")).map_err(Error::connect_failure)?;
        }
        let variant = variant_key(&record.vary, headers);
        let (meta_path, body_path, tmp_path) = self.paths(url, &variant);
        fs::write(&tmp_path, body).map_err(Error::connect_failure)?;
        fs::rename(&tmp_path, &body_path).map_err(Error::connect_failure)?;
        fs::write(&meta_path, serde_json::to_vec(record).map_err(Error::decode_error)?)
            .map_err(Error::connect_failure)?;
        Ok(())
    }

    /// Removes every stored variant of `url` (every `<sha1(url)>_*.json`/`.body`
    /// file, plus the `.vary` sidecar), for an unsafe-method request that hits a
    /// previously cached representation. Missing files are not an error.
    pub fn invalidate(&self, url: &str) {
        let hash = url_hash(url);
        let Ok(entries) = fs::read_dir(&self.dir) else { return };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&format!("{hash}_")) || name == format!("{hash}.vary") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    #[test]
    fn stores_and_loads_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let record = CacheRecord {
            url: "http://example.com/a".into(),
            status: 200,
            status_message: Some("OK".into()),
            headers: vec![("content-type".into(), "text/plain".into())],
            stored_at_ms: entry::now_ms(),
            etag: Some("\"v1\"".into()),
            last_modified: None,
            max_age: Some(60),
            s_maxage: None,
            must_revalidate: false,
            vary: Vec::new(),
        };
        store.store("http://example.com/a", &HeaderMap::new(), &record, b"hello").unwrap();

        let (loaded, body) = store.load("http://example.com/a", &HeaderMap::new()).unwrap();
        assert_eq!(loaded.etag, record.etag);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn miss_when_nothing_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        assert!(store.load("http://example.com/missing", &HeaderMap::new()).is_none());
    }

    #[test]
    fn invalidate_removes_all_variants() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let mut record = CacheRecord {
            url: "http://example.com/a".into(),
            status: 200,
            status_message: None,
            headers: Vec::new(),
            stored_at_ms: entry::now_ms(),
            etag: None,
            last_modified: None,
            max_age: Some(60),
            s_maxage: None,
            must_revalidate: false,
            vary: vec!["accept-encoding".into()],
        };
        let mut gzip_headers = HeaderMap::new();
        gzip_headers.insert("accept-encoding", http::HeaderValue::from_static("gzip"));
        store.store("http://example.com/a", &gzip_headers, &record, b"gz").unwrap();
        record.vary.clear();
        store.store("http://example.com/a", &HeaderMap::new(), &record, b"identity").unwrap();

        store.invalidate("http://example.com/a");

        assert!(store.load("http://example.com/a", &gzip_headers).is_none());
        assert!(store.load("http://example.com/a", &HeaderMap::new()).is_none());
    }

    #[test]
    fn vary_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let mut record = CacheRecord {
            url: "http://example.com/a".into(),
            status: 200,
            status_message: None,
            headers: Vec::new(),
            stored_at_ms: entry::now_ms(),
            etag: None,
            last_modified: None,
            max_age: Some(60),
            s_maxage: None,
            must_revalidate: false,
            vary: vec!["accept-encoding".into()],
        };
        let mut stored_with = HeaderMap::new();
        stored_with.insert("accept-encoding", http::HeaderValue::from_static("gzip"));
        store.store("http://example.com/a", &stored_with, &record, b"z").unwrap();
        record.vary.clear();

        let mut looked_up_with = HeaderMap::new();
        looked_up_with.insert("accept-encoding", http::HeaderValue::from_static("identity"));
        assert!(store.load("http://example.com/a", &looked_up_with).is_none());
    }
}
