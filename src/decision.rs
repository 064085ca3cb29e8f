//! The regeneration decision engine.
//!
//! One call per request: look up the cached entry, apply the precedence
//! chain (forced refresh, version mismatch, traffic sampling), take the
//! regeneration lock when a rebuild is due, and say how the request should
//! proceed. Exactly one of three things comes back: a servable entry, a
//! ticket to render and capture, or an instruction to render uncached.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    config::{CacheConfig, REGEN_LOCK_TTL},
    context::RequestContext,
    entry::CacheEntry,
    error::{ConfigError, StoreError},
    keys::{self, Keys},
    store::CacheStore,
    telemetry,
    variants::{self, EvaluatorInput, VariantRecord, VariantRegistry},
};

const METRIC_HIT_TOTAL: &str = "respiro_page_hit_total";
const METRIC_BYPASS_TOTAL: &str = "respiro_page_bypass_total";
const METRIC_STORE_ERROR_TOTAL: &str = "respiro_store_error_total";

/// The cache engine. Build one per application and share it behind an
/// [`Arc`]; it holds no per-request state.
pub struct PageCache {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    variants: VariantRegistry,
}

/// How a request should proceed after the cache decision.
#[derive(Debug)]
pub enum Flow {
    /// Serve the cached entry; do not render.
    Hit(CacheHit),
    /// Render, then hand the response to [`PageCache::capture`].
    Render(RenderTicket),
    /// Render without touching the cache.
    Bypass(BypassReason),
}

/// A servable cached entry.
#[derive(Debug)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub freshness: Freshness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Expired, served while another request regenerates the page.
    Stale,
}

impl Freshness {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
        }
    }
}

/// Why a request is rendering uncached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Caching is disabled by configuration.
    Disabled,
    /// Traffic has not reached the sampling threshold for this page.
    BelowSampleThreshold,
    /// A rebuild is due but another request holds the regeneration lock
    /// and no stale copy was servable.
    LockBusy,
}

impl BypassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::BelowSampleThreshold => "below_sample_threshold",
            Self::LockBusy => "lock_busy",
        }
    }
}

/// Permission to render and capture one page.
///
/// Issued only to the request that won the regeneration lock. Hand it back
/// to [`PageCache::capture`] once the response is final, whatever the
/// outcome; capture releases the lock on every path.
#[derive(Debug)]
pub struct RenderTicket {
    pub(crate) context: RequestContext,
    pub(crate) keys: Keys,
    pub(crate) prior_entry: Option<CacheEntry>,
    pub(crate) resource_version: u64,
    pub(crate) force_refresh: bool,
    pub(crate) started_at: OffsetDateTime,
    pub(crate) veto: CacheVeto,
}

impl RenderTicket {
    /// Handle the application can use to veto caching of this response.
    pub fn veto_handle(&self) -> CacheVeto {
        self.veto.clone()
    }

    /// Entry this render is replacing, when one was still stored.
    pub fn prior_entry(&self) -> Option<&CacheEntry> {
        self.prior_entry.as_ref()
    }
}

/// Cancellation flag for a render in progress.
///
/// Cloneable and cheap; the middleware exposes it through request
/// extensions so any handler can call [`CacheVeto::cancel`].
#[derive(Debug, Clone, Default)]
pub struct CacheVeto(Arc<AtomicBool>);

impl CacheVeto {
    /// Veto caching of the response being rendered.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl PageCache {
    /// Build an engine with no app-registered variance dimensions.
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Result<Self, ConfigError> {
        Self::with_variants(config, store, VariantRegistry::new())
    }

    /// Build an engine with app-registered variance dimensions.
    ///
    /// Registers the built-in response-cookie dimension when the
    /// configuration enables it.
    pub fn with_variants(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        mut variants: VariantRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        telemetry::describe_metrics();
        if config.vary_on_response_cookies {
            variants.register_response_cookies()?;
        }
        Ok(Self {
            config,
            store,
            variants,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn CacheStore {
        self.store.as_ref()
    }

    pub(crate) fn variants(&self) -> &VariantRegistry {
        &self.variants
    }

    /// Decide how to handle a request.
    ///
    /// Store failures never surface here. Every operation degrades to the
    /// conservative default, so the worst a broken store causes is an
    /// uncached render.
    pub async fn begin(&self, ctx: &RequestContext) -> Flow {
        if !self.config.is_enabled() {
            counter!(METRIC_BYPASS_TOTAL, "reason" => BypassReason::Disabled.as_str())
                .increment(1);
            return Flow::Bypass(BypassReason::Disabled);
        }

        let now = OffsetDateTime::now_utc();
        let force_refresh =
            keys::force_refresh_requested(ctx.query(), self.config.force_refresh_token.as_deref());

        // Page-level keys do not depend on variants, so a variant-free
        // bundle is enough to reach the persisted dimension set and the
        // version.
        let page_keys = keys::generate(ctx, &VariantRecord::new(), force_refresh);
        let resource_version = self.fetch_version(&page_keys.version_key()).await;
        let persisted_ids = self.fetch_dimension_ids(&page_keys.vary_key()).await;

        let input = EvaluatorInput {
            context: ctx,
            prior_entry: None,
        };
        let record = self.variants.evaluate_ids(&persisted_ids, &input);
        let request_keys = keys::generate(ctx, &record, force_refresh);

        let mut entry = self.fetch_entry(request_keys.entry_key()).await;

        let mut must_regenerate = false;
        let mut use_stale = self.config.use_stale_while_revalidate;

        if force_refresh {
            // An explicit refresh drops the entry up front and must hand
            // this caller a fresh render, never a stale copy.
            self.delete_quietly(request_keys.entry_key()).await;
            entry = None;
            use_stale = false;
            must_regenerate = true;
            debug!(page = %request_keys.page_key(), "forced refresh requested");
        } else if entry
            .as_ref()
            .is_some_and(|entry| entry.resource_version != resource_version)
        {
            must_regenerate = true;
        } else if !self.config.sampling_enabled() {
            // Sampling off: rebuild whenever there is no fresh copy.
            if entry.as_ref().is_none_or(|entry| !entry.is_fresh(now)) {
                must_regenerate = true;
            }
        } else {
            let window_open = match &entry {
                None => true,
                Some(entry) => {
                    now.unix_timestamp()
                        >= entry.created_at + self.config.max_age_secs as i64
                            - self.config.sampling_window_secs as i64
                }
            };
            if window_open {
                let visits = self.record_visit(&request_keys.request_count_key()).await;
                let expired = entry.as_ref().is_none_or(|entry| !entry.is_fresh(now));
                if visits >= self.config.min_visits_before_regen && expired {
                    self.delete_quietly(&request_keys.request_count_key()).await;
                    must_regenerate = true;
                }
            }
        }

        let mut lock_acquired = false;
        if must_regenerate {
            lock_acquired = self.acquire_lock(&request_keys.lock_key()).await;
        }

        if let Some(candidate) = entry {
            let fresh = candidate.is_fresh(now);
            if !lock_acquired && (fresh || (must_regenerate && use_stale)) {
                let freshness = if fresh {
                    Freshness::Fresh
                } else {
                    Freshness::Stale
                };
                counter!(METRIC_HIT_TOTAL, "freshness" => freshness.as_str()).increment(1);
                debug!(
                    outcome = "hit",
                    freshness = freshness.as_str(),
                    page = %request_keys.page_key(),
                    "serving cached page"
                );
                return Flow::Hit(CacheHit {
                    entry: candidate,
                    freshness,
                });
            }
            // Not servable here; keep it as the prior entry for capture.
            entry = Some(candidate);
        }

        if must_regenerate && lock_acquired {
            debug!(outcome = "render", page = %request_keys.page_key(), "regenerating page");
            return Flow::Render(RenderTicket {
                context: ctx.clone(),
                keys: request_keys,
                prior_entry: entry,
                resource_version,
                force_refresh,
                started_at: now,
                veto: CacheVeto::default(),
            });
        }

        let reason = if must_regenerate {
            BypassReason::LockBusy
        } else {
            BypassReason::BelowSampleThreshold
        };
        counter!(METRIC_BYPASS_TOTAL, "reason" => reason.as_str()).increment(1);
        debug!(
            outcome = "bypass",
            reason = reason.as_str(),
            page = %request_keys.page_key(),
            "rendering uncached"
        );
        Flow::Bypass(reason)
    }

    /// Invalidate every cached variant of a page by bumping its version
    /// counter. Stored entries stay put; the next request regenerates.
    ///
    /// Unlike the request path, this is an explicit administrative action,
    /// so store failures surface to the caller.
    pub async fn bump_version(&self, ctx: &RequestContext) -> Result<u64, StoreError> {
        let keys = keys::generate(ctx, &VariantRecord::new(), false);
        let version_key = keys.version_key();
        self.store.add(&version_key, b"0".to_vec(), None).await?;
        let bumped = self.store.incr(&version_key, 1).await?;
        debug!(page = %keys.page_key(), version = bumped, "bumped page version");
        Ok(bumped.unwrap_or(0))
    }

    // ========================================================================
    // Store access, fail-open
    // ========================================================================

    async fn fetch_version(&self, version_key: &str) -> u64 {
        match self.store.get(version_key).await {
            Ok(Some(bytes)) => parse_version(&bytes),
            Ok(None) => 0,
            Err(error) => {
                self.note_store_error("get", &error);
                0
            }
        }
    }

    async fn fetch_dimension_ids(&self, vary_key: &str) -> Vec<String> {
        match self.store.get(vary_key).await {
            Ok(Some(bytes)) => variants::decode_dimension_ids(&bytes).unwrap_or_else(|| {
                debug!(key = vary_key, "persisted dimension set was undecodable");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(error) => {
                self.note_store_error("get", &error);
                Vec::new()
            }
        }
    }

    async fn fetch_entry(&self, entry_key: &str) -> Option<CacheEntry> {
        match self.store.get(entry_key).await {
            Ok(Some(bytes)) => match CacheEntry::from_bytes(&bytes) {
                Ok(entry) => Some(entry),
                Err(error) => {
                    debug!(key = entry_key, error = %error, "cached entry was undecodable");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                self.note_store_error("get", &error);
                None
            }
        }
    }

    /// Count a visit inside the sampling window. A failed increment reads
    /// as zero visits, which keeps the page below the threshold.
    async fn record_visit(&self, count_key: &str) -> u64 {
        if let Err(error) = self.store.add(count_key, b"0".to_vec(), None).await {
            self.note_store_error("add", &error);
        }
        match self.store.incr(count_key, 1).await {
            Ok(Some(count)) => count,
            Ok(None) => 0,
            Err(error) => {
                self.note_store_error("incr", &error);
                0
            }
        }
    }

    async fn acquire_lock(&self, lock_key: &str) -> bool {
        match self.store.add(lock_key, b"1".to_vec(), Some(REGEN_LOCK_TTL)).await {
            Ok(acquired) => acquired,
            Err(error) => {
                self.note_store_error("add", &error);
                false
            }
        }
    }

    pub(crate) async fn delete_quietly(&self, key: &str) {
        if let Err(error) = self.store.delete(key).await {
            self.note_store_error("delete", &error);
        }
    }

    pub(crate) fn note_store_error(&self, op: &'static str, error: &StoreError) {
        counter!(METRIC_STORE_ERROR_TOTAL, "op" => op).increment(1);
        warn!(op, error = %error, "store operation failed, continuing uncached");
    }
}

fn parse_version(bytes: &[u8]) -> u64 {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veto_flag_propagates_across_clones() {
        let veto = CacheVeto::default();
        let clone = veto.clone();

        assert!(!veto.is_cancelled());
        clone.cancel();
        assert!(veto.is_cancelled());
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(Freshness::Fresh.as_str(), "fresh");
        assert_eq!(Freshness::Stale.as_str(), "stale");
        assert_eq!(BypassReason::Disabled.as_str(), "disabled");
        assert_eq!(
            BypassReason::BelowSampleThreshold.as_str(),
            "below_sample_threshold"
        );
        assert_eq!(BypassReason::LockBusy.as_str(), "lock_busy");
    }

    #[test]
    fn parse_version_defaults_to_zero() {
        assert_eq!(parse_version(b"42"), 42);
        assert_eq!(parse_version(b" 7 "), 7);
        assert_eq!(parse_version(b"junk"), 0);
        assert_eq!(parse_version(b""), 0);
    }
}
