use crate::metrics::collector::DiscoveryMetrics;
use crate::{KubedoxError, Result};
use prometheus::{Encoder, TextEncoder};

/// Renders discovery metrics in the Prometheus text exposition format
pub struct PrometheusExporter {
    metrics: DiscoveryMetrics,
}

impl PrometheusExporter {
    pub fn new(metrics: DiscoveryMetrics) -> Self {
        Self { metrics }
    }

    pub fn format_current_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.metrics.registry().gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| KubedoxError::MetricsError(e.to_string()))
    }
}
