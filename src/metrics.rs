use crate::RenderError;
use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Handles to every metric the render service reports
///
/// Handles are resolved against whichever recorder is installed when the
/// struct is built; with no recorder they are no-ops.
pub struct RenderMetrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub renders_succeeded: Counter,
    pub renders_failed: Counter,
    pub render_duration: Histogram,
    pub queue_rejections: Counter,
    pub timeout_errors: Counter,
    pub browser_unavailable: Counter,
    pub active_renders: Gauge,
    pub queue_length: Gauge,
    pub cache_size: Gauge,
}

impl RenderMetrics {
    pub fn new() -> Self {
        Self {
            cache_hits: register_counter!("page2img_cache_hits_total"),
            cache_misses: register_counter!("page2img_cache_misses_total"),
            renders_succeeded: register_counter!("page2img_renders_succeeded_total"),
            renders_failed: register_counter!("page2img_renders_failed_total"),
            render_duration: register_histogram!("page2img_render_duration_seconds"),
            queue_rejections: register_counter!("page2img_queue_rejections_total"),
            timeout_errors: register_counter!("page2img_timeout_errors_total"),
            browser_unavailable: register_counter!("page2img_browser_unavailable_total"),
            active_renders: register_gauge!("page2img_active_renders"),
            queue_length: register_gauge!("page2img_queue_length"),
            cache_size: register_gauge!("page2img_cache_size"),
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.increment(1);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.increment(1);
    }

    pub fn record_render(&self, duration: Duration, success: bool) {
        if success {
            self.renders_succeeded.increment(1);
        } else {
            self.renders_failed.increment(1);
        }

        self.render_duration.record(duration.as_secs_f64());
    }

    pub fn record_error(&self, error: &RenderError) {
        match error {
            RenderError::QueueFull { .. } => self.queue_rejections.increment(1),
            RenderError::BrowserUnavailable => self.browser_unavailable.increment(1),
            e if e.is_timeout() => self.timeout_errors.increment(1),
            _ => {}
        }
    }

    pub fn set_gate(&self, active: usize, queued: usize) {
        self.active_renders.set(active as f64);
        self.queue_length.set(queued as f64);
    }

    pub fn set_cache_size(&self, size: usize) {
        self.cache_size.set(size as f64);
    }
}

impl Default for RenderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder globally.
///
/// Must run before any [`RenderMetrics`] is built for its handles to report.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, RenderError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| RenderError::ConfigurationError(format!("metrics recorder: {e}")))?;
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        let metrics = RenderMetrics::new();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_render(Duration::from_millis(120), true);
        metrics.record_render(Duration::from_millis(30), false);
        metrics.record_error(&RenderError::QueueFull { limit: 100 });
        metrics.record_error(&RenderError::NavigationTimeout(Duration::from_secs(30)));
        metrics.set_gate(2, 1);
        metrics.set_cache_size(10);
    }
}
