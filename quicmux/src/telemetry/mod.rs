//! # Telemetry and Observability
//!
//! Structured logging through `tracing` and event-driven metrics exported
//! over OTLP.
//!
//! ## Architecture
//!
//! 1. **Hot path** (shard loops, writer threads): fire-and-forget
//!    [`record_metric`] calls, one channel send each.
//! 2. **Collector task**: a tokio task on the main runtime maps events onto
//!    OpenTelemetry instruments.
//! 3. **Logging**: per-packet detail at `trace`/`debug` only; lifecycle events
//!    at `info`; consistency problems at `warn`/`error`.

pub mod config;
pub mod metrics;

pub use config::TelemetryConfig;
pub use metrics::{
    record_metric, start_metrics_task, DropReason, MetricsEvent, MetricsHandle, MetricsTimer,
};

use crate::config::global::LoggingConfig;
use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize logging, then start the metrics collector if enabled.
pub async fn init_telemetry(
    config: &TelemetryConfig,
    logging: &LoggingConfig,
    runtime_handle: &tokio::runtime::Handle,
) -> Result<MetricsHandle> {
    init_logging(logging, &config.service_name)?;

    let metrics_handle = if config.enable_metrics {
        tracing::info!(
            service = %config.service_name,
            endpoint = %config.otlp_endpoint,
            interval_secs = config.export_interval_secs,
            "Starting event-driven metrics system"
        );
        start_metrics_task(config, runtime_handle).await?
    } else {
        tracing::warn!("Metrics collection is disabled");
        MetricsHandle::disabled()
    };

    Ok(metrics_handle)
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig, service_name: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.level.to_string()))
        .context("building log filter")?;

    let fmt_layer = if logging.json_format {
        tracing_subscriber::fmt::layer()
            .json()
            .with_thread_names(true)
            .with_file(logging.include_file_line)
            .with_line_number(logging.include_file_line)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(logging.enable_colors)
            .with_file(logging.include_file_line)
            .with_line_number(logging.include_file_line)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    tracing::info!(service = %service_name, level = %logging.level, "Logging initialized");
    Ok(())
}
