use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus metrics recorder, optionally exposing the
/// scrape endpoint on a dedicated address.
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<()> {
    let mut builder = PrometheusBuilder::new();
    if let Some(addr) = listen {
        builder = builder.with_http_listener(addr);
    }
    builder.install()?;
    Ok(())
}
