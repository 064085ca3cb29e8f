//! Axum integration.
//!
//! Wraps the engine as a tower middleware: gates requests the cache must
//! not touch, serves hits, and buffers rendered responses into the capture
//! step. Handlers veto caching through the [`CacheVeto`] request extension.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::{StreamExt, stream};
use metrics::counter;
use tracing::{debug, warn};

use crate::{
    capture::CaptureOutcome,
    context::RequestContext,
    decision::{CacheVeto, Flow, PageCache},
    httpdate,
    serve::{self, CACHE_STATUS_HEADER},
};

const METRIC_COOKIE_SKIP_TOTAL: &str = "respiro_cookie_skip_total";

/// Per-request uniqueness values, inserted by an upstream layer before the
/// cache runs. Each value becomes part of the entry key.
#[derive(Debug, Clone, Default)]
pub struct Uniqueness(pub BTreeMap<String, String>);

/// Shared state for [`page_cache_layer`].
#[derive(Clone)]
pub struct PageCacheState {
    pub cache: Arc<PageCache>,
}

impl From<Arc<PageCache>> for PageCacheState {
    fn from(cache: Arc<PageCache>) -> Self {
        Self { cache }
    }
}

/// Full-page cache middleware.
///
/// Serves cached pages for GET and HEAD requests and captures rendered
/// ones. Anything else passes through untouched: other methods, exempt
/// cookies, or a disabled cache.
pub async fn page_cache_layer(
    State(state): State<PageCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let cache = &state.cache;

    if !cache.config().is_enabled() {
        return next.run(request).await;
    }
    if request.method() != Method::GET && request.method() != Method::HEAD {
        return next.run(request).await;
    }

    let mut ctx = RequestContext::from_parts(request.method(), request.uri(), request.headers());
    if let Some(Uniqueness(values)) = request.extensions().get::<Uniqueness>() {
        for (key, value) in values {
            ctx = ctx.with_uniqueness(key.clone(), value.clone());
        }
    }

    if cache.config().cookies_exempt(ctx.cookies()) {
        counter!(METRIC_COOKIE_SKIP_TOTAL).increment(1);
        debug!(outcome = "bypass", reason = "cookie_exempt", path = ctx.path(), "request exempt by cookie");
        return next.run(request).await;
    }

    match cache.begin(&ctx).await {
        Flow::Hit(hit) => cache.hit_response(&ctx, &hit),
        Flow::Render(ticket) => {
            let mut request = request;
            request.extensions_mut().insert::<CacheVeto>(ticket.veto_handle());
            let mut response = next.run(request).await;

            let limit = cache.config().response_body_limit_bytes;
            let declared_len = response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok());
            if declared_len.is_some_and(|len| len > limit as u64) {
                // Too big to buffer. Serve it uncached; the lock still has
                // to come off.
                debug!(len = declared_len, limit, "response exceeds capture limit");
                ticket.veto_handle().cancel();
                let outcome = cache
                    .capture(ticket, response.status(), response.headers(), &[])
                    .await;
                decorate_rendered(cache, &mut response, &outcome);
                return response;
            }

            let (parts, body) = response.into_parts();
            match buffer_for_capture(body, limit).await {
                Buffered::Complete(bytes) => {
                    let outcome =
                        cache.capture(ticket, parts.status, &parts.headers, &bytes).await;
                    let mut response = Response::from_parts(parts, Body::from(bytes));
                    decorate_rendered(cache, &mut response, &outcome);
                    response
                }
                Buffered::Overflowed(body) => {
                    // Undeclared length that ran past the limit. Same exit
                    // as the declared case: uncached, lock released.
                    debug!(limit, "streamed response exceeded capture limit");
                    ticket.veto_handle().cancel();
                    let outcome = cache
                        .capture(ticket, parts.status, &parts.headers, &[])
                        .await;
                    let mut response = Response::from_parts(parts, body);
                    decorate_rendered(cache, &mut response, &outcome);
                    response
                }
                Buffered::Failed => {
                    // The body is consumed and cannot be replayed.
                    ticket.veto_handle().cancel();
                    cache.capture(ticket, parts.status, &parts.headers, &[]).await;
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        Flow::Bypass(_) => {
            let mut response = next.run(request).await;
            serve::ensure_vary_cookie(response.headers_mut());
            response
        }
    }
}

enum Buffered {
    /// Whole body collected within the limit.
    Complete(Bytes),
    /// Body ran past the limit. Holds a replacement body that replays the
    /// buffered prefix and then the rest of the original stream.
    Overflowed(Body),
    /// Body stream failed part-way; nothing left to send.
    Failed,
}

/// Collect a response body for capture without ever holding more than the
/// limit plus one chunk in memory.
async fn buffer_for_capture(body: Body, limit: usize) -> Buffered {
    let mut stream = body.into_data_stream();
    let mut collected: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                warn!(error = %error, "failed to buffer response for capture");
                return Buffered::Failed;
            }
        };
        collected.extend_from_slice(&chunk);
        if collected.len() > limit {
            let prefix = Bytes::from(collected);
            let resumed =
                stream::once(async move { Ok::<_, axum::Error>(prefix) }).chain(stream);
            return Buffered::Overflowed(Body::from_stream(resumed));
        }
    }

    Buffered::Complete(Bytes::from(collected))
}

/// Decorate a rendered response on its way out: `Vary: Cookie`, the
/// configured always-send headers, freshness headers when the page was
/// stored, and the cache marker.
fn decorate_rendered(cache: &PageCache, response: &mut Response, outcome: &CaptureOutcome) {
    serve::ensure_vary_cookie(response.headers_mut());
    cache.append_always_send_headers(response.headers_mut());

    if let CaptureOutcome::Stored(stored) = outcome
        && cache.config().send_freshness_headers
    {
        let headers = response.headers_mut();
        if !headers.contains_key(header::LAST_MODIFIED)
            && let Ok(created) = time::OffsetDateTime::from_unix_timestamp(stored.created_at)
            && let Some(formatted) = httpdate::format(created)
            && let Ok(value) = HeaderValue::try_from(formatted)
        {
            headers.insert(header::LAST_MODIFIED, value);
        }
        if !headers.contains_key(header::CACHE_CONTROL)
            && let Ok(value) = HeaderValue::try_from(format!(
                "max-age=0, s-maxage={}, must-revalidate",
                stored.max_age_secs
            ))
        {
            headers.insert(header::CACHE_CONTROL, value);
        }
    }

    response.headers_mut().insert(
        HeaderName::from_static(CACHE_STATUS_HEADER),
        HeaderValue::from_static("miss"),
    );
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use axum::{Router, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;
    use crate::{config::CacheConfig, store::MemoryStore};

    fn app(config: CacheConfig) -> Router {
        let cache = Arc::new(PageCache::new(config, Arc::new(MemoryStore::new())).unwrap());
        let state = PageCacheState::from(cache);
        Router::new()
            .route("/page", get(|| async { "rendered" }))
            .route(
                "/veto",
                get(|request: Request<Body>| async move {
                    if let Some(veto) = request.extensions().get::<CacheVeto>() {
                        veto.cancel();
                    }
                    "private"
                }),
            )
            .layer(middleware::from_fn_with_state(state, page_cache_layer))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn post_requests_pass_through_untouched() {
        let app = Router::new()
            .route("/page", axum::routing::post(|| async { "posted" }))
            .layer(middleware::from_fn_with_state(
                PageCacheState::from(Arc::new(
                    PageCache::new(CacheConfig::default(), Arc::new(MemoryStore::new())).unwrap(),
                )),
                page_cache_layer,
            ));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/page")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(CACHE_STATUS_HEADER));
        assert!(!response.headers().contains_key(header::VARY));
    }

    #[tokio::test]
    async fn exempt_cookies_bypass_the_engine_entirely() {
        let app = app(CacheConfig::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/page")
                    .header(header::COOKIE, "session_id=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(CACHE_STATUS_HEADER));
    }

    #[tokio::test]
    async fn first_request_misses_and_second_hits() {
        let app = app(CacheConfig::default());

        let miss = app.clone().oneshot(get_request("/page")).await.unwrap();
        assert_eq!(miss.headers().get(CACHE_STATUS_HEADER).unwrap(), "miss");
        assert!(miss.headers().contains_key(header::LAST_MODIFIED));
        assert_eq!(
            miss.headers().get(header::CACHE_CONTROL).unwrap(),
            "max-age=0, s-maxage=300, must-revalidate"
        );

        let hit = app.clone().oneshot(get_request("/page")).await.unwrap();
        assert_eq!(hit.headers().get(CACHE_STATUS_HEADER).unwrap(), "hit");
        assert_eq!(hit.headers().get(header::VARY).unwrap(), "Cookie");

        let body = axum::body::to_bytes(hit.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"rendered");
    }

    #[tokio::test]
    async fn vetoed_responses_are_not_cached() {
        let app = app(CacheConfig::default());

        let first = app.clone().oneshot(get_request("/veto")).await.unwrap();
        assert_eq!(first.headers().get(CACHE_STATUS_HEADER).unwrap(), "miss");

        // Still a miss: the veto kept it out of the store.
        let second = app.clone().oneshot(get_request("/veto")).await.unwrap();
        assert_eq!(second.headers().get(CACHE_STATUS_HEADER).unwrap(), "miss");
    }
}
