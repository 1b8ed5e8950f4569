//! Prometheus export of engine counters.
//!
//! Counters are recorded through the `metrics` facade wherever the events
//! happen; without an installed recorder they cost nothing.

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Install the Prometheus exporter when `config.enabled` is set.
///
/// The exporter serves `/metrics` on `config.listen`. Installing twice in
/// one process fails.
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|e| Error::Metrics(e.to_string()))?;
    describe();

    info!(listen = %config.listen, "Metrics exporter listening");
    Ok(())
}

fn describe() {
    describe_counter!(
        "nullroute_queries_total",
        "DNS requests read from the tunnel, by action taken"
    );
    describe_counter!(
        "nullroute_pending_evictions_total",
        "Upstream queries given up before an answer arrived"
    );
    describe_counter!("nullroute_reconnects_total", "Tunnel reconnections, by reason");
}
