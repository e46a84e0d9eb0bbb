//! Log subscriber and metrics recorder installation.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};
use crate::error::{HostError, Result};

/// Installs the global tracing subscriber.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .map_err(|e| HostError::Telemetry(e.to_string()))
}

/// Installs the Prometheus recorder and its scrape endpoint.
///
/// Must be called from within a Tokio runtime.
pub fn install_metrics(config: &Config) -> Result<SocketAddr> {
    let addr: SocketAddr = config
        .metrics_addr
        .parse()
        .map_err(|e| HostError::Telemetry(format!("invalid METRICS_ADDR: {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| HostError::Telemetry(e.to_string()))?;
    Ok(addr)
}
