use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub kind: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the cache.
pub struct Metrics {
    // -- ensure --
    pub ensure_total: Family<OutcomeLabels, Counter>,
    pub ensure_errors_total: Family<ErrorLabels, Counter>,

    // -- upstream --
    pub clone_duration_seconds: Histogram,
    pub probe_duration_seconds: Histogram,

    // -- usage --
    pub requests_total: Counter,

    // -- gauges --
    pub mirrors_total: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let ensure_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "mirrorcache_ensure",
            "Mirror lookups by outcome (reused, revalidated, materialized)",
            ensure_total.clone(),
        );

        let ensure_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "mirrorcache_ensure_errors",
            "Failed mirror lookups by error kind",
            ensure_errors_total.clone(),
        );

        let clone_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 14));
        registry.register(
            "mirrorcache_clone_duration_seconds",
            "Full mirror clone latency in seconds",
            clone_duration_seconds.clone(),
        );

        let probe_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        registry.register(
            "mirrorcache_probe_duration_seconds",
            "Remote HEAD probe latency in seconds",
            probe_duration_seconds.clone(),
        );

        let requests_total = Counter::default();
        registry.register(
            "mirrorcache_requests",
            "Repository requests received, cache hits included",
            requests_total.clone(),
        );

        let mirrors_total: Gauge = Gauge::default();
        registry.register(
            "mirrorcache_mirrors",
            "Number of mirrors present on disk at the last health check",
            mirrors_total.clone(),
        );

        Self {
            ensure_total,
            ensure_errors_total,
            clone_duration_seconds,
            probe_duration_seconds,
            requests_total,
            mirrors_total,
        }
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.ensure_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn record_error(&self, kind: &str) {
        self.ensure_errors_total
            .get_or_create(&ErrorLabels {
                kind: kind.to_string(),
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`](crate::AppState).
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all cache metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_output_contains_recorded_outcomes() {
        let registry = MetricsRegistry::new();
        registry.metrics.record_outcome("materialized");
        registry.metrics.record_error("timeout");

        let text = registry.encode().unwrap();
        assert!(text.contains("mirrorcache_ensure_total{outcome=\"materialized\"} 1"));
        assert!(text.contains("mirrorcache_ensure_errors_total{kind=\"timeout\"} 1"));
    }
}
