//! Logging setup and metric registration.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::ConfigError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[default]
    Compact,
}

/// Install a process-global tracing subscriber, for hosts that do not
/// bring their own. `RUST_LOG` overrides the default `info` level.
pub fn init(format: LogFormat) -> Result<(), ConfigError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|error| {
            ConfigError::telemetry(format!("failed to install tracing subscriber: {error}"))
        })
}

/// Register metric metadata with the installed recorder. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "respiro_page_hit_total",
            Unit::Count,
            "Pages served from cache, labelled by freshness."
        );
        describe_counter!(
            "respiro_page_bypass_total",
            Unit::Count,
            "Requests rendered uncached, labelled by reason."
        );
        describe_counter!(
            "respiro_cookie_skip_total",
            Unit::Count,
            "Requests exempted from caching by their cookies."
        );
        describe_counter!(
            "respiro_capture_store_total",
            Unit::Count,
            "Rendered pages persisted to the cache."
        );
        describe_counter!(
            "respiro_capture_skip_total",
            Unit::Count,
            "Rendered pages rejected by capture eligibility rules, labelled by reason."
        );
        describe_counter!(
            "respiro_store_error_total",
            Unit::Count,
            "Key-value store operations that failed, labelled by operation."
        );
        describe_histogram!(
            "respiro_generation_seconds",
            Unit::Seconds,
            "Time spent rendering pages that were captured."
        );
    });
}
