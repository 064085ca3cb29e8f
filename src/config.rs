//! Page cache configuration.

use std::{collections::BTreeMap, path::Path, time::Duration};

use axum::http::{HeaderName, HeaderValue};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ConfigError;

/// Query parameter that requests an explicit refresh of the cached page.
pub const FORCE_REFRESH_PARAM: &str = "force_cache_refresh";

/// How long a regeneration lock may outlive its holder.
pub(crate) const REGEN_LOCK_TTL: Duration = Duration::from_secs(10);

/// Grace added to entry TTLs so expired copies survive long enough to be
/// served stale while a replacement renders.
const ENTRY_TTL_GRACE_SECS: u64 = 30;

/// Slack added to the persisted dimension-set TTL beyond the page lifetime.
const VARY_TTL_SLACK_SECS: u64 = 10;

const LOCAL_CONFIG_BASENAME: &str = "respiro";
const ENV_PREFIX: &str = "RESPIRO";

const DEFAULT_MAX_AGE_SECS: u64 = 300;
const DEFAULT_SAMPLING_WINDOW_SECS: u64 = 270;
const DEFAULT_MIN_VISITS: u64 = 1;
const DEFAULT_RESPONSE_BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Cache behavior knobs, usually loaded from `respiro.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds a cached page stays fresh. Zero disables caching entirely.
    pub max_age_secs: u64,
    /// Length of the trailing window before expiry in which traffic is
    /// sampled. Zero disables sampling and caches every page eagerly.
    pub sampling_window_secs: u64,
    /// Visits required inside the sampling window before a page is cached
    /// or regenerated. Zero disables sampling.
    pub min_visits_before_regen: u64,
    /// Serve an expired copy while one request renders the replacement.
    pub use_stale_while_revalidate: bool,
    /// Capture and replay HTTP redirects.
    pub cache_redirects: bool,
    /// Split a page into per-cookie-set slots instead of refusing to cache
    /// responses that set cookies.
    pub vary_on_response_cookies: bool,
    /// Cookie names that keep a request cacheable even when other cookies
    /// would exempt it.
    pub always_cache_cookies: Vec<String>,
    /// Cookie names that exempt a request from the cache.
    pub never_cache_cookies: Vec<String>,
    /// Cookie name prefixes that exempt a request from the cache.
    pub never_cache_cookie_prefixes: Vec<String>,
    /// Secret required in the refresh query parameter. Unset disables
    /// forced refreshes.
    pub force_refresh_token: Option<String>,
    /// Response headers never persisted with an entry, lowercase.
    pub uncached_headers: Vec<String>,
    /// Headers added to every response the engine serves or captures.
    pub always_send_headers: BTreeMap<String, String>,
    /// Emit `Last-Modified` and `Cache-Control` for cached pages and honor
    /// `If-Modified-Since` on the way back in.
    pub send_freshness_headers: bool,
    /// Largest response body the middleware will buffer for capture.
    pub response_body_limit_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            sampling_window_secs: DEFAULT_SAMPLING_WINDOW_SECS,
            min_visits_before_regen: DEFAULT_MIN_VISITS,
            use_stale_while_revalidate: true,
            cache_redirects: false,
            vary_on_response_cookies: false,
            always_cache_cookies: Vec::new(),
            never_cache_cookies: Vec::new(),
            never_cache_cookie_prefixes: vec!["session".to_string(), "auth".to_string()],
            force_refresh_token: None,
            uncached_headers: vec!["transfer-encoding".to_string()],
            always_send_headers: BTreeMap::new(),
            send_freshness_headers: true,
            response_body_limit_bytes: DEFAULT_RESPONSE_BODY_LIMIT_BYTES,
        }
    }
}

impl CacheConfig {
    /// Load configuration with file then environment precedence.
    ///
    /// Reads `respiro.*` from the working directory when present, then an
    /// explicit file when one is given, then `RESPIRO_*` environment
    /// variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config: Self = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(token) = &self.force_refresh_token {
            if token.is_empty() {
                return Err(ConfigError::invalid(
                    "force_refresh_token",
                    "must not be empty",
                ));
            }
        }
        for prefix in &self.never_cache_cookie_prefixes {
            if prefix.is_empty() {
                return Err(ConfigError::invalid(
                    "never_cache_cookie_prefixes",
                    "prefixes must not be empty",
                ));
            }
        }
        for name in &self.uncached_headers {
            if HeaderName::try_from(name.as_str()).is_err() {
                return Err(ConfigError::invalid(
                    "uncached_headers",
                    format!("`{name}` is not a valid header name"),
                ));
            }
        }
        for (name, value) in &self.always_send_headers {
            if HeaderName::try_from(name.as_str()).is_err() {
                return Err(ConfigError::invalid(
                    "always_send_headers",
                    format!("`{name}` is not a valid header name"),
                ));
            }
            if HeaderValue::try_from(value.as_str()).is_err() {
                return Err(ConfigError::invalid(
                    "always_send_headers",
                    format!("value for `{name}` is not a valid header value"),
                ));
            }
        }
        Ok(())
    }

    /// Caching is off entirely when pages have no lifetime.
    pub fn is_enabled(&self) -> bool {
        self.max_age_secs >= 1
    }

    /// Traffic sampling is active only when both knobs are non-zero.
    pub fn sampling_enabled(&self) -> bool {
        self.sampling_window_secs >= 1 && self.min_visits_before_regen >= 1
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// TTL for a stored entry: its freshness lifetime plus the sampling
    /// window and a grace period, so stale copies are still around to serve.
    pub fn entry_ttl(&self, effective_max_age_secs: u64) -> Duration {
        Duration::from_secs(
            effective_max_age_secs + self.sampling_window_secs + ENTRY_TTL_GRACE_SECS,
        )
    }

    /// TTL for the persisted dimension-id set.
    pub fn vary_ttl(&self) -> Duration {
        Duration::from_secs(self.max_age_secs + VARY_TTL_SLACK_SECS)
    }

    /// Whether request cookies exempt this request from caching.
    ///
    /// Any cookie named on the `always_cache_cookies` list keeps the whole
    /// request cacheable, no matter what else rides along. Otherwise the
    /// request is exempt when any cookie matches `never_cache_cookies`
    /// exactly or `never_cache_cookie_prefixes` by prefix.
    pub fn cookies_exempt(&self, cookies: &[(String, String)]) -> bool {
        if cookies
            .iter()
            .any(|(name, _)| self.always_cache_cookies.iter().any(|allowed| allowed == name))
        {
            return false;
        }
        cookies.iter().any(|(name, _)| {
            self.never_cache_cookies.iter().any(|denied| denied == name)
                || self
                    .never_cache_cookie_prefixes
                    .iter()
                    .any(|prefix| name.starts_with(prefix.as_str()))
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
