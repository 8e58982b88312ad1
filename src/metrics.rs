use anyhow::Context;
use axum::{routing::get, Router};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::FeedsConfig;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and publish the static sizing
    /// gauges of the running configuration.
    pub fn init(cfg: &FeedsConfig) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        gauge!("page_cache_max_entries").set(cfg.cache.max_entries as f64);
        gauge!("feed_page_size").set(cfg.page_size as f64);
        gauge!("feed_buffer_low_water_mark").set(cfg.buffer_low_water_mark as f64);

        Ok(Self { handle })
    }

    /// Recorder that is not installed globally (tests, embedding).
    pub fn detached() -> Self {
        Self {
            handle: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
