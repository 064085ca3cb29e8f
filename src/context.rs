//! Request-scoped inputs for cache decisions.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, Method, Uri, header};

/// Immutable snapshot of the request attributes the cache reads.
///
/// The engine and variant evaluators only ever see this view, never the
/// live request, so a decision cannot depend on anything that was not
/// captured up front.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: Method,
    host: String,
    path: String,
    query: String,
    https: bool,
    headers: HeaderMap,
    cookies: Vec<(String, String)>,
    uniqueness: BTreeMap<String, String>,
}

impl RequestContext {
    /// Build a context from request parts.
    ///
    /// The host comes from the URI authority when present, falling back to
    /// the `Host` header, lowercased either way. TLS is detected from the
    /// URI scheme or an `x-forwarded-proto: https` set by a fronting proxy.
    pub fn from_parts(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let host = uri
            .authority()
            .map(|authority| authority.as_str().to_string())
            .or_else(|| {
                headers
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(ToString::to_string)
            })
            .unwrap_or_default()
            .to_ascii_lowercase();

        let https = uri.scheme_str() == Some("https")
            || headers
                .get("x-forwarded-proto")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));

        Self {
            method: method.clone(),
            host,
            path: uri.path().to_string(),
            query: uri.query().unwrap_or_default().to_string(),
            https,
            headers: headers.clone(),
            cookies: parse_cookies(headers),
            uniqueness: BTreeMap::new(),
        }
    }

    /// Attach an app-specific identity value, e.g. a device class.
    ///
    /// Uniqueness values become part of the cache key, so two requests with
    /// different values never share a cached page.
    pub fn with_uniqueness(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.uniqueness.insert(key.into(), value.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, exactly as the request sent it.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn is_https(&self) -> bool {
        self.https
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Request cookies in arrival order.
    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn uniqueness(&self) -> &BTreeMap<String, String> {
        &self.uniqueness
    }

    /// First value of the named cookie, if the request sent it.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(cookie, _)| cookie == name)
            .map(|(_, value)| value.as_str())
    }

    /// First value of the named request header, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((name, value)) => {
                    cookies.push((name.trim().to_string(), value.trim().to_string()));
                }
                None => cookies.push((pair.to_string(), String::new())),
            }
        }
    }
    cookies
}

// ============================================================================
// Tests
// ============================================================================
