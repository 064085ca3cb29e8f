//! End-to-end tests through the axum layer: real routers, real requests,
//! cached replays, conditional responses and the passthrough paths.

use std::{
    collections::BTreeMap,
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    middleware::{self, Next},
    response::{Html, Response},
    routing::get,
};
use futures::stream;
use http_body_util::BodyExt;
use respiro::{
    CACHE_STATUS_HEADER, CacheConfig, MemoryStore, PageCache, PageCacheState, Uniqueness,
    page_cache_layer,
};
use tower::ServiceExt;

fn cache_app(config: CacheConfig, router: Router) -> Router {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(PageCache::new(config, store).expect("engine should build"));
    router.layer(middleware::from_fn_with_state(
        PageCacheState::from(cache),
        page_cache_layer,
    ))
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::HOST, "test.example")
        .body(Body::empty())
        .expect("request should build")
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

fn cache_marker(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
}

async fn body_to_string(body: Body) -> String {
    let bytes = body.collect().await.expect("collect body").to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

#[tokio::test]
async fn cached_pages_render_once_and_replay() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    let app = cache_app(
        CacheConfig::default(),
        Router::new().route(
            "/page",
            get(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Html(format!("<html>render {n}</html>"))
                }
            }),
        ),
    );

    let response = send(&app, get_request("/page")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(cache_marker(&response), Some("miss"));
    assert_eq!(
        response
            .headers()
            .get(header::VARY)
            .and_then(|value| value.to_str().ok()),
        Some("Cookie")
    );
    assert_eq!(
        response
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok()),
        Some("max-age=0, s-maxage=300, must-revalidate")
    );
    assert!(response.headers().contains_key(header::LAST_MODIFIED));
    assert_eq!(body_to_string(response.into_body()).await, "<html>render 1</html>");

    let response = send(&app, get_request("/page")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(cache_marker(&response), Some("hit"));
    let cache_control = response
        .headers()
        .get(header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .expect("hit should carry cache-control")
        .to_string();
    assert!(cache_control.starts_with("max-age=0, s-maxage="));
    assert!(cache_control.ends_with(", must-revalidate"));
    assert_eq!(body_to_string(response.into_body()).await, "<html>render 1</html>");

    assert_eq!(calls.load(Ordering::SeqCst), 1, "handler ran once");
}

#[tokio::test]
async fn matching_etag_returns_not_modified() {
    let app = cache_app(
        CacheConfig::default(),
        Router::new().route(
            "/tagged",
            get(|| async { ([(header::ETAG, "\"v1\"")], Html("<html>tagged</html>")) }),
        ),
    );

    let response = send(&app, get_request("/tagged")).await;
    assert_eq!(cache_marker(&response), Some("miss"));

    let mut request = get_request("/tagged");
    request
        .headers_mut()
        .insert(header::IF_NONE_MATCH, "\"v1\"".parse().expect("header value"));
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(
        response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok()),
        Some("\"v1\"")
    );
    assert_eq!(body_to_string(response.into_body()).await, "");

    // A different validator gets the full body.
    let mut request = get_request("/tagged");
    request
        .headers_mut()
        .insert(header::IF_NONE_MATCH, "\"v2\"".parse().expect("header value"));
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_string(response.into_body()).await, "<html>tagged</html>");
}

#[tokio::test]
async fn if_modified_since_honors_the_entry_timestamp() {
    let app = cache_app(
        CacheConfig::default(),
        Router::new().route("/dated", get(|| async { Html("<html>dated</html>") })),
    );

    let response = send(&app, get_request("/dated")).await;
    let last_modified = response
        .headers()
        .get(header::LAST_MODIFIED)
        .cloned()
        .expect("miss should carry last-modified");

    let mut request = get_request("/dated");
    request
        .headers_mut()
        .insert(header::IF_MODIFIED_SINCE, last_modified);
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(body_to_string(response.into_body()).await, "");

    // A stamp older than the entry means the client's copy is outdated.
    let mut request = get_request("/dated");
    request.headers_mut().insert(
        header::IF_MODIFIED_SINCE,
        "Mon, 01 Jan 2001 00:00:00 GMT".parse().expect("header value"),
    );
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_string(response.into_body()).await, "<html>dated</html>");
}

#[tokio::test]
async fn cached_redirects_replay_status_and_location() {
    let app = cache_app(
        CacheConfig {
            cache_redirects: true,
            ..CacheConfig::default()
        },
        Router::new().route(
            "/moved",
            get(|| async {
                (
                    StatusCode::MOVED_PERMANENTLY,
                    [(header::LOCATION, "/new-home")],
                    "moved",
                )
            }),
        ),
    );

    let response = send(&app, get_request("/moved")).await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(cache_marker(&response), Some("miss"));

    let response = send(&app, get_request("/moved")).await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(cache_marker(&response), Some("hit"));
    assert_eq!(
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok()),
        Some("/new-home")
    );
    // Replays carry the redirect, never the captured body.
    assert_eq!(body_to_string(response.into_body()).await, "");
}

#[tokio::test]
async fn server_errors_pass_through_uncached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    let app = cache_app(
        CacheConfig::default(),
        Router::new().route(
            "/broken",
            get(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::INTERNAL_SERVER_ERROR, Html("<html>broken</html>"))
                }
            }),
        ),
    );

    for _ in 0..2 {
        let response = send(&app, get_request("/broken")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(cache_marker(&response), Some("miss"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2, "errors render every time");
}

#[tokio::test]
async fn cookie_setting_pages_stay_uncached_without_variance() {
    let route = |calls: Arc<AtomicUsize>| {
        Router::new().route(
            "/login",
            get(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([(header::SET_COOKIE, "prefs=dark")], Html("<html>login</html>"))
                }
            }),
        )
    };

    let calls = Arc::new(AtomicUsize::new(0));
    let app = cache_app(CacheConfig::default(), route(Arc::clone(&calls)));
    for _ in 0..2 {
        let response = send(&app, get_request("/login")).await;
        assert_eq!(cache_marker(&response), Some("miss"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // With per-cookie variance the page is cacheable, cookie included.
    let calls = Arc::new(AtomicUsize::new(0));
    let app = cache_app(
        CacheConfig {
            vary_on_response_cookies: true,
            ..CacheConfig::default()
        },
        route(Arc::clone(&calls)),
    );
    let response = send(&app, get_request("/login")).await;
    assert_eq!(cache_marker(&response), Some("miss"));
    let response = send(&app, get_request("/login")).await;
    assert_eq!(cache_marker(&response), Some("hit"));
    assert_eq!(
        response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|value| value.to_str().ok()),
        Some("prefs=dark")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn allow_listed_cookie_overrides_exempt_cookies() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    let app = cache_app(
        CacheConfig {
            always_cache_cookies: vec!["consent_state".to_string()],
            ..CacheConfig::default()
        },
        Router::new().route(
            "/page",
            get(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Html("<html>page</html>")
                }
            }),
        ),
    );

    let with_jar = || {
        let mut request = get_request("/page");
        request.headers_mut().insert(
            header::COOKIE,
            "consent_state=ok; session_id=abc".parse().expect("header value"),
        );
        request
    };

    // The allow-listed cookie keeps the whole jar cacheable, session
    // cookie and all.
    let response = send(&app, with_jar()).await;
    assert_eq!(cache_marker(&response), Some("miss"));
    let response = send(&app, with_jar()).await;
    assert_eq!(cache_marker(&response), Some("hit"));
    assert_eq!(body_to_string(response.into_body()).await, "<html>page</html>");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Without it the session cookie bypasses the engine entirely.
    let mut request = get_request("/page");
    request
        .headers_mut()
        .insert(header::COOKIE, "session_id=abc".parse().expect("header value"));
    let response = send(&app, request).await;
    assert_eq!(cache_marker(&response), None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn query_parameter_order_shares_one_slot() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    let app = cache_app(
        CacheConfig::default(),
        Router::new().route(
            "/list",
            get(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Html("<html>list</html>")
                }
            }),
        ),
    );

    let response = send(&app, get_request("/list?b=2&a=1")).await;
    assert_eq!(cache_marker(&response), Some("miss"));
    let response = send(&app, get_request("/list?a=1&b=2")).await;
    assert_eq!(cache_marker(&response), Some("hit"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn caller_supplied_uniqueness_splits_slots() {
    async fn tag_device(mut request: Request<Body>, next: Next) -> Response {
        if let Some(device) = request
            .headers()
            .get("x-device")
            .and_then(|value| value.to_str().ok())
        {
            let mut values = BTreeMap::new();
            values.insert("device".to_string(), device.to_string());
            request.extensions_mut().insert(Uniqueness(values));
        }
        next.run(request).await
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    // The tagging layer sits outside the cache so the extension is in
    // place before the cache builds its keys.
    let app = cache_app(
        CacheConfig::default(),
        Router::new().route(
            "/home",
            get(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Html(format!("<html>render {n}</html>"))
                }
            }),
        ),
    )
    .layer(middleware::from_fn(tag_device));

    let desktop = || {
        let mut request = get_request("/home");
        request
            .headers_mut()
            .insert("x-device", "desktop".parse().expect("header value"));
        request
    };
    let mobile = || {
        let mut request = get_request("/home");
        request
            .headers_mut()
            .insert("x-device", "mobile".parse().expect("header value"));
        request
    };

    let response = send(&app, desktop()).await;
    assert_eq!(body_to_string(response.into_body()).await, "<html>render 1</html>");
    let response = send(&app, mobile()).await;
    assert_eq!(cache_marker(&response), Some("miss"));
    assert_eq!(body_to_string(response.into_body()).await, "<html>render 2</html>");

    let response = send(&app, desktop()).await;
    assert_eq!(cache_marker(&response), Some("hit"));
    assert_eq!(body_to_string(response.into_body()).await, "<html>render 1</html>");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn head_requests_get_their_own_slot() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    let app = cache_app(
        CacheConfig::default(),
        Router::new().route(
            "/methods",
            get(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Html(format!("<html>render {n}</html>"))
                }
            }),
        ),
    );
    let head_request = || {
        Request::builder()
            .method(Method::HEAD)
            .uri("/methods")
            .header(header::HOST, "test.example")
            .body(Body::empty())
            .expect("request should build")
    };

    let response = send(&app, get_request("/methods")).await;
    assert_eq!(cache_marker(&response), Some("miss"));
    let response = send(&app, head_request()).await;
    assert_eq!(cache_marker(&response), Some("miss"));

    let response = send(&app, get_request("/methods")).await;
    assert_eq!(cache_marker(&response), Some("hit"));
    assert_eq!(body_to_string(response.into_body()).await, "<html>render 1</html>");
    let response = send(&app, head_request()).await;
    assert_eq!(cache_marker(&response), Some("hit"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn oversized_declared_bodies_pass_through_uncached() {
    let app = cache_app(
        CacheConfig {
            response_body_limit_bytes: 4,
            ..CacheConfig::default()
        },
        Router::new().route(
            "/big",
            get(|| async {
                Response::builder()
                    .header(header::CONTENT_LENGTH, "10")
                    .body(Body::from("0123456789"))
                    .expect("response should build")
            }),
        ),
    );

    for _ in 0..2 {
        let response = send(&app, get_request("/big")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(cache_marker(&response), Some("miss"));
        assert_eq!(body_to_string(response.into_body()).await, "0123456789");
    }
}

#[tokio::test]
async fn oversized_streamed_bodies_pass_through_uncached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    let app = cache_app(
        CacheConfig {
            response_body_limit_bytes: 4,
            ..CacheConfig::default()
        },
        Router::new().route(
            "/stream",
            get(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let chunks = ["01234", "56789"].map(|part| Ok::<_, Infallible>(part));
                    Body::from_stream(stream::iter(chunks))
                }
            }),
        ),
    );

    // No declared length, so the limit only shows up part-way through the
    // body. The page still reaches the client whole.
    for _ in 0..2 {
        let response = send(&app, get_request("/stream")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(cache_marker(&response), Some("miss"));
        assert!(!response.headers().contains_key(header::CONTENT_LENGTH));
        assert_eq!(body_to_string(response.into_body()).await, "0123456789");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2, "oversized pages render every time");
}

#[tokio::test]
async fn disabled_cache_adds_no_headers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    let app = cache_app(
        CacheConfig {
            max_age_secs: 0,
            ..CacheConfig::default()
        },
        Router::new().route(
            "/page",
            get(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Html("<html>page</html>")
                }
            }),
        ),
    );

    for _ in 0..2 {
        let response = send(&app, get_request("/page")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(cache_marker(&response), None);
        assert!(!response.headers().contains_key(header::VARY));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
