use anyhow::Result;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{EdgeProxyError, Result as EdgeResult};
use crate::proxy::RequestClass;

/// Metrics collector for the edge proxy
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
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            prometheus_handle,
        })
    }

    /// Collector that records nothing
    pub fn disabled() -> Self {
        Self {
            config: MetricsConfig::default(),
            prometheus_handle: None,
        }
    }

    fn register_metrics() {
        describe_counter!("edge_requests_total", "Requests handled, by admission class");
        describe_counter!("edge_cache_hits_total", "Cacheable GETs served from the store");
        describe_counter!("edge_cache_misses_total", "Cacheable GETs forwarded to origin");
        describe_counter!("edge_cache_store_errors_total", "Swallowed cache store failures");
        describe_counter!("edge_origin_errors_total", "Requests answered with the synthetic 502");
        describe_histogram!("edge_request_duration_seconds", "End-to-end handling time");
        describe_histogram!("edge_origin_response_seconds", "Time until origin response headers");
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Start the metrics server
    pub async fn start_server(&self, config: &MetricsConfig) -> EdgeResult<()> {
        if !config.enabled {
            return Ok(());
        }

        let handle = match &self.prometheus_handle {
            Some(handle) => handle.clone(),
            None => {
                return Err(EdgeProxyError::Internal(
                    "Prometheus handle not available".to_string(),
                ))
            }
        };

        let app = Router::new()
            .route(&config.path, get(move || async move { handle.render() }))
            .route("/health", get(|| async { "OK" }));

        let addr = format!("0.0.0.0:{}", config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            EdgeProxyError::Internal(format!("Failed to bind metrics server: {}", e))
        })?;

        info!("Metrics server listening on {}{}", addr, config.path);

        axum::serve(listener, app)
            .await
            .map_err(|e| EdgeProxyError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }

    pub fn record_request(&self, class: RequestClass, duration: f64) {
        if !self.config.enabled {
            return;
        }

        counter!("edge_requests_total", "class" => class.as_str()).increment(1);
        histogram!("edge_request_duration_seconds", "class" => class.as_str()).record(duration);
    }

    pub fn record_cache_hit(&self) {
        if self.config.enabled {
            counter!("edge_cache_hits_total").increment(1);
        }
    }

    pub fn record_cache_miss(&self) {
        if self.config.enabled {
            counter!("edge_cache_misses_total").increment(1);
        }
    }

    pub fn record_store_error(&self, op: &'static str) {
        if self.config.enabled {
            counter!("edge_cache_store_errors_total", "op" => op).increment(1);
        }
    }

    pub fn record_origin_error(&self) {
        if self.config.enabled {
            counter!("edge_origin_errors_total").increment(1);
        }
    }
}
