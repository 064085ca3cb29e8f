//! Serving cached entries: header synthesis, conditional requests, replay.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use time::OffsetDateTime;

use crate::{
    context::RequestContext,
    decision::{CacheHit, Freshness, PageCache},
    entry::{self, CacheEntry, CachedRedirect},
    httpdate,
};

/// Marker header describing how the engine handled a request:
/// `hit`, `stale` or `miss`.
pub const CACHE_STATUS_HEADER: &str = "x-respiro-cache";

impl PageCache {
    /// Build the response for a cache hit.
    pub fn hit_response(&self, ctx: &RequestContext, hit: &CacheHit) -> Response {
        let entry = &hit.entry;

        if self.config().cache_redirects
            && let Some(redirect) = &entry.redirect
        {
            return self.redirect_response(redirect, hit.freshness);
        }

        let now = OffsetDateTime::now_utc();
        let mut headers = self.merged_headers(entry);

        if self.config().send_freshness_headers && !entry.has_header("last-modified") {
            let created = OffsetDateTime::from_unix_timestamp(entry.created_at).unwrap_or(now);
            if let Some(formatted) = httpdate::format(created)
                && let Ok(value) = HeaderValue::try_from(formatted)
            {
                headers.insert(header::LAST_MODIFIED, value);
            }
            // Shared caches downstream get the remaining lifetime, not the
            // original one.
            let remaining = entry.remaining_secs(now);
            if let Ok(value) =
                HeaderValue::try_from(format!("max-age=0, s-maxage={remaining}, must-revalidate"))
            {
                headers.insert(header::CACHE_CONTROL, value);
            }
        }

        ensure_vary_cookie(&mut headers);
        headers.insert(
            HeaderName::from_static(CACHE_STATUS_HEADER),
            freshness_marker(hit.freshness),
        );

        if self.not_modified(ctx, entry) {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_MODIFIED;
            *response.headers_mut() = headers;
            return response;
        }

        let mut response = Response::new(Body::from(entry.body.clone()));
        *response.status_mut() = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
        *response.headers_mut() = headers;
        response
    }

    /// Whether a conditional request is satisfied by the cached entry.
    ///
    /// `If-None-Match` is compared against the captured `ETag` whenever
    /// both exist. `If-Modified-Since` applies only when freshness headers
    /// are enabled; the comparison point is the captured `Last-Modified`
    /// when the page sent one, otherwise the entry's creation time.
    pub fn not_modified(&self, ctx: &RequestContext, entry: &CacheEntry) -> bool {
        if let Some(tag) = ctx.header("if-none-match")
            && let Some(current) = entry.header_values("etag").first()
        {
            return tag == current.as_str();
        }
        if self.config().send_freshness_headers
            && let Some(since) = ctx.header("if-modified-since").and_then(httpdate::parse)
        {
            let modified_at = entry
                .header_values("last-modified")
                .first()
                .and_then(|value| httpdate::parse(value))
                .map(|parsed| parsed.unix_timestamp())
                .unwrap_or(entry.created_at);
            return since.unix_timestamp() >= modified_at;
        }
        false
    }

    /// Replay a captured redirect: status and `Location` only, no body and
    /// no entry headers.
    fn redirect_response(&self, redirect: &CachedRedirect, freshness: Freshness) -> Response {
        let mut headers = HeaderMap::new();
        self.append_always_send_headers(&mut headers);
        ensure_vary_cookie(&mut headers);
        headers.insert(
            HeaderName::from_static(CACHE_STATUS_HEADER),
            freshness_marker(freshness),
        );
        if let Ok(value) = HeaderValue::try_from(redirect.location.as_str()) {
            headers.insert(header::LOCATION, value);
        }

        let mut response = Response::new(Body::empty());
        *response.status_mut() = entry::redirect_replay_status(redirect.status);
        *response.headers_mut() = headers;
        response
    }

    /// Entry headers first, then configured always-send headers for any
    /// value not already present under its name.
    fn merged_headers(&self, entry: &CacheEntry) -> HeaderMap {
        let mut merged = HeaderMap::new();
        for (name, values) in &entry.headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                    merged.append(name.clone(), value);
                }
            }
        }
        self.append_always_send_headers(&mut merged);
        merged
    }

    pub(crate) fn append_always_send_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.config().always_send_headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            let Ok(value) = HeaderValue::try_from(value.as_str()) else {
                continue;
            };
            if !headers
                .get_all(&name)
                .iter()
                .any(|existing| existing == &value)
            {
                headers.append(name, value);
            }
        }
    }
}

/// Append `Cookie` to `Vary` unless some value already lists it. Cached
/// pages depend on request cookies through the exemption rules, so every
/// response the engine touches must say so.
pub(crate) fn ensure_vary_cookie(headers: &mut HeaderMap) {
    let already_varies = headers.get_all(header::VARY).iter().any(|value| {
        value.to_str().is_ok_and(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("cookie"))
        })
    });
    if !already_varies {
        headers.append(header::VARY, HeaderValue::from_static("Cookie"));
    }
}

fn freshness_marker(freshness: Freshness) -> HeaderValue {
    match freshness {
        Freshness::Fresh => HeaderValue::from_static("hit"),
        Freshness::Stale => HeaderValue::from_static("stale"),
    }
}

// ============================================================================
// Tests
// ============================================================================
