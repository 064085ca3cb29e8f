//! The cached unit: one rendered page under one (page, variant) pair.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{config::CacheConfig, error::StoreError};

/// One cached response, stored as JSON under its entry key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Captured body bytes.
    #[serde(with = "body_encoding")]
    pub body: Vec<u8>,
    /// Unix seconds when generation of this entry started.
    pub created_at: i64,
    /// Seconds the render took.
    pub generation_secs: f64,
    /// Captured headers: lowercase names, value order preserved.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Captured response status code.
    pub status: u16,
    /// Captured status line, when the response was not a plain 200.
    pub status_line: Option<String>,
    /// Redirect to replay instead of the body.
    pub redirect: Option<CachedRedirect>,
    /// Effective freshness lifetime in seconds.
    pub max_age_secs: u64,
    /// Resource version the entry was generated under.
    pub resource_version: u64,
}

/// Captured redirect target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRedirect {
    pub status: u16,
    pub location: String,
}

impl CacheEntry {
    pub fn age_secs(&self, now: OffsetDateTime) -> i64 {
        now.unix_timestamp() - self.created_at
    }

    /// Fresh entries are inside their freshness lifetime.
    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        now.unix_timestamp() < self.created_at + self.max_age_secs as i64
    }

    /// Seconds of shared-cache lifetime left, zero once expired.
    pub fn remaining_secs(&self, now: OffsetDateTime) -> u64 {
        (self.created_at + self.max_age_secs as i64 - now.unix_timestamp()).max(0) as u64
    }

    /// Captured values for a header, by lowercase name.
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.get(name).is_some_and(|values| !values.is_empty())
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|error| StoreError::codec(error.to_string()))
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|error| StoreError::codec(error.to_string()))
    }
}

/// Collect response headers for storage: names lowercased, configured
/// uncached names dropped, non-UTF-8 values skipped.
pub(crate) fn capture_headers(
    headers: &HeaderMap,
    config: &CacheConfig,
) -> BTreeMap<String, Vec<String>> {
    let mut captured: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        captured
            .entry(name.as_str().to_string())
            .or_default()
            .push(value.to_string());
    }
    for name in &config.uncached_headers {
        captured.remove(&name.to_ascii_lowercase());
    }
    captured
}

/// Freshness lifetime override from a captured `Cache-Control` header.
///
/// `s-maxage` wins over `max-age`; within one directive the last valid
/// occurrence wins.
pub(crate) fn max_age_override(headers: &BTreeMap<String, Vec<String>>) -> Option<u64> {
    let values = headers.get("cache-control")?;
    let mut max_age = None;
    let mut s_maxage = None;
    for value in values {
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if let Some(seconds) = directive.strip_prefix("s-maxage=") {
                s_maxage = seconds.trim().parse::<u64>().ok().or(s_maxage);
            } else if let Some(seconds) = directive.strip_prefix("max-age=") {
                max_age = seconds.trim().parse::<u64>().ok().or(max_age);
            }
        }
    }
    s_maxage.or(max_age)
}

/// Status to replay for a captured redirect. The well-known 3xx range
/// replays as captured; anything else degrades to `302 Found`.
pub(crate) fn redirect_replay_status(status: u16) -> StatusCode {
    match status {
        300..=307 => StatusCode::from_u16(status).unwrap_or(StatusCode::FOUND),
        _ => StatusCode::FOUND,
    }
}

mod body_encoding {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use axum::http::{HeaderName, HeaderValue};
    use time::OffsetDateTime;

    use super::*;

    fn entry(created_at: i64, max_age_secs: u64) -> CacheEntry {
        CacheEntry {
            body: b"<html>ok</html>".to_vec(),
            created_at,
            generation_secs: 0.25,
            headers: BTreeMap::new(),
            status: 200,
            status_line: None,
            redirect: None,
            max_age_secs,
            resource_version: 3,
        }
    }

    #[test]
    fn serde_round_trips_binary_bodies() {
        let mut original = entry(1_700_000_000, 300);
        original.body = vec![0x00, 0xff, 0x80, 0x7f];
        original.headers.insert(
            "content-type".to_string(),
            vec!["text/html".to_string()],
        );
        original.status_line = Some("HTTP/1.1 404 Not Found".to_string());
        original.redirect = Some(CachedRedirect {
            status: 301,
            location: "https://example.com/new".to_string(),
        });

        let decoded = CacheEntry::from_bytes(&original.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        assert!(matches!(
            CacheEntry::from_bytes(b"{not json"),
            Err(StoreError::Codec { .. })
        ));
    }

    #[test]
    fn freshness_boundaries() {
        let entry = entry(1_000, 300);

        let just_before = OffsetDateTime::from_unix_timestamp(1_299).unwrap();
        let at_expiry = OffsetDateTime::from_unix_timestamp(1_300).unwrap();

        assert!(entry.is_fresh(just_before));
        assert_eq!(entry.remaining_secs(just_before), 1);
        assert!(!entry.is_fresh(at_expiry));
        assert_eq!(entry.remaining_secs(at_expiry), 0);
        assert_eq!(entry.age_secs(at_expiry), 300);
    }

    #[test]
    fn capture_strips_uncached_headers_and_lowercases() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("text/html"),
        );
        headers.append(
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("a=1"),
        );
        headers.append(
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("b=2"),
        );
        headers.insert(
            HeaderName::from_static("transfer-encoding"),
            HeaderValue::from_static("chunked"),
        );

        let captured = capture_headers(&headers, &CacheConfig::default());

        assert_eq!(captured.get("content-type"), Some(&vec!["text/html".to_string()]));
        assert_eq!(
            captured.get("set-cookie"),
            Some(&vec!["a=1".to_string(), "b=2".to_string()])
        );
        assert!(!captured.contains_key("transfer-encoding"));
    }

    #[test]
    fn max_age_override_prefers_s_maxage() {
        let mut headers = BTreeMap::new();
        headers.insert(
            "cache-control".to_string(),
            vec!["public, max-age=60, s-maxage=600".to_string()],
        );
        assert_eq!(max_age_override(&headers), Some(600));

        headers.insert(
            "cache-control".to_string(),
            vec!["max-age=60".to_string()],
        );
        assert_eq!(max_age_override(&headers), Some(60));

        headers.insert(
            "cache-control".to_string(),
            vec!["no-store, max-age=abc".to_string()],
        );
        assert_eq!(max_age_override(&headers), None);

        headers.remove("cache-control");
        assert_eq!(max_age_override(&headers), None);
    }

    #[test]
    fn redirect_status_replays_known_codes_only() {
        assert_eq!(redirect_replay_status(301), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(redirect_replay_status(307), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(redirect_replay_status(308), StatusCode::FOUND);
        assert_eq!(redirect_replay_status(200), StatusCode::FOUND);
    }
}
