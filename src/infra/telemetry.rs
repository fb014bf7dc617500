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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "storyrender_render_total",
            Unit::Count,
            "Total number of renders run through the queue, labelled by status."
        );
        describe_counter!(
            "storyrender_render_failed_total",
            Unit::Count,
            "Total number of renders that ended in an error."
        );
        describe_histogram!(
            "storyrender_render_ms",
            Unit::Milliseconds,
            "Time from rule selection to result delivery in milliseconds."
        );
        describe_counter!(
            "storyrender_render_timeout_total",
            Unit::Count,
            "Total number of correlated renders that received no response in time."
        );
        describe_gauge!(
            "storyrender_pending_renders",
            Unit::Count,
            "Current number of correlated renders awaiting a response."
        );
        describe_gauge!(
            "storyrender_queue_depth",
            Unit::Count,
            "Current number of renders admitted but not yet started."
        );
    });
}
