use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::config::MetricsConfig;
use super::logger::ActivityStatus;

/// Metrics collector that handles all application metrics
pub struct MetricsCollector {
    config: MetricsConfig,
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prometheus_handle = if config.enabled {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

            Self::register_metrics();
            info!("Prometheus metrics exposed at {}", config.path);
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            prometheus_handle,
        })
    }

    /// Collector that records nothing.
    pub fn disabled() -> Self {
        Self {
            config: MetricsConfig::default(),
            prometheus_handle: None,
        }
    }

    fn register_metrics() {
        describe_counter!("proxy_attempts_total", "Proxy attempts by logged outcome");
        describe_counter!("proxy_rejected_total", "Requests rejected before gating");
        describe_histogram!("proxy_upstream_duration_seconds", "Time until upstream response headers");
        describe_counter!("proxy_responses_total", "Emitted responses by body handling mode");
        describe_counter!("proxy_decode_fallbacks_total", "Text bodies passed through because they could not be decoded within limits");
    }

    pub fn render(&self) -> Option<String> {
        self.prometheus_handle.as_ref().map(PrometheusHandle::render)
    }

    pub fn record_outcome(&self, status: ActivityStatus) {
        if !self.config.enabled {
            return;
        }
        counter!("proxy_attempts_total", "status" => status.as_str()).increment(1);
    }

    pub fn record_rejection(&self, error_code: &'static str) {
        if !self.config.enabled {
            return;
        }
        counter!("proxy_rejected_total", "reason" => error_code).increment(1);
    }

    pub fn record_upstream(&self, status: u16, duration: f64) {
        if !self.config.enabled {
            return;
        }
        let status_class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "unknown",
        };
        histogram!("proxy_upstream_duration_seconds", "status" => status_class).record(duration);
    }

    pub fn record_emission(&self, rewritten: bool) {
        if !self.config.enabled {
            return;
        }
        let mode = if rewritten { "rewritten" } else { "passthrough" };
        counter!("proxy_responses_total", "mode" => mode).increment(1);
    }

    pub fn record_decode_fallback(&self) {
        if !self.config.enabled {
            return;
        }
        counter!("proxy_decode_fallbacks_total").increment(1);
    }
}
