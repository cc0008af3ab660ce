use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
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
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "render_cache_requests_total",
            Unit::Count,
            "Requests seen by the render cache, labelled by outcome and bot flag."
        );
        describe_counter!(
            "render_cache_evictions_total",
            Unit::Count,
            "Stored outputs removed from the cache, labelled by cause."
        );
        describe_counter!(
            "render_cache_render_failures_total",
            Unit::Count,
            "Renders that returned an error or panicked."
        );
        describe_histogram!(
            "render_cache_render_ms",
            Unit::Milliseconds,
            "Render latency in milliseconds."
        );
        describe_gauge!(
            "render_cache_base_keys",
            Unit::Count,
            "Base keys currently tracked by the variant index."
        );
        describe_gauge!(
            "render_cache_variants",
            Unit::Count,
            "Relevant allocations currently tracked by the variant index."
        );
        describe_gauge!(
            "render_cache_in_flight",
            Unit::Count,
            "Renders currently in progress."
        );
        describe_gauge!(
            "render_cache_store_bytes",
            Unit::Bytes,
            "Approximate bytes held by stored outputs."
        );
        describe_counter!(
            "render_cache_leak_warnings_total",
            Unit::Count,
            "Leak monitor threshold breaches, labelled by measure."
        );
    });
}
