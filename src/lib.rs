//! Full-page response cache for dynamically rendered applications.
//!
//! respiro sits in front of rendering. Per request it decides whether a
//! stored page can be served, coordinates which request is allowed to
//! rebuild an expired one, and captures rendered responses for reuse, all
//! over a minimal key-value store contract.
//!
//! The moving parts:
//!
//! - **Decision engine** ([`PageCache::begin`]): canonical keys, variance
//!   dimensions, traffic-gated regeneration, a short-lived single-winner
//!   lock, stale-while-revalidate.
//! - **Capture** ([`PageCache::capture`]): eligibility rules (no server
//!   errors, no empty bodies, no surprise cookies) and persistence.
//! - **Serving**: cached replay with freshness headers and conditional
//!   request support.
//! - **Axum layer** ([`page_cache_layer`]): wires the three into a tower
//!   stack; handlers opt out per response via [`CacheVeto`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use axum::{Router, middleware, routing::get};
//! use respiro::{CacheConfig, MemoryStore, PageCache, PageCacheState, page_cache_layer};
//!
//! # fn main() -> Result<(), respiro::ConfigError> {
//! let cache = Arc::new(PageCache::new(
//!     CacheConfig::default(),
//!     Arc::new(MemoryStore::new()),
//! )?);
//!
//! let app: Router = Router::new()
//!     .route("/", get(|| async { "hello" }))
//!     .layer(middleware::from_fn_with_state(
//!         PageCacheState::from(cache),
//!         page_cache_layer,
//!     ));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod keys;
pub mod store;

mod capture;
mod decision;
mod entry;
mod error;
mod httpdate;
mod middleware;
mod serve;
mod telemetry;
mod variants;

pub use capture::{CaptureOutcome, SkipReason, StoredEntry};
pub use config::{CacheConfig, FORCE_REFRESH_PARAM};
pub use context::RequestContext;
pub use decision::{BypassReason, CacheHit, CacheVeto, Flow, Freshness, PageCache, RenderTicket};
pub use entry::{CacheEntry, CachedRedirect};
pub use error::{ConfigError, StoreError};
pub use keys::Keys;
pub use middleware::{PageCacheState, Uniqueness, page_cache_layer};
pub use serve::CACHE_STATUS_HEADER;
pub use store::{CacheStore, MemoryStore};
pub use telemetry::{LogFormat, describe_metrics, init as init_telemetry};
pub use variants::{
    EvaluatorInput, RESPONSE_COOKIES_DIMENSION, VariantRecord, VariantRegistry,
};
