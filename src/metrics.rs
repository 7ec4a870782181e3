use prometheus::{
    Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector for the gatekeeper
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Admission metrics
    decisions: IntCounterVec,
    exempt_requests: IntCounter,
    fail_open: IntCounter,
    admission_duration: Histogram,

    // Store metrics
    store_failures: IntCounterVec,
    store_operation_duration: HistogramVec,
    store_healthy: Gauge,

    // Fallback metrics
    fallback_buckets: Gauge,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = IntCounterVec::new(
            Opts::new(
                "gatekeeper_decisions_total",
                "Admission decisions by outcome and source",
            ),
            &["outcome", "source"],
        )?;

        let exempt_requests = IntCounter::new(
            "gatekeeper_exempt_requests_total",
            "Requests that bypassed admission control",
        )?;

        let fail_open = IntCounter::new(
            "gatekeeper_fail_open_total",
            "Requests forwarded unthrottled after an unexpected admission fault",
        )?;

        let admission_duration = Histogram::with_opts(HistogramOpts::new(
            "gatekeeper_admission_duration_seconds",
            "Duration of admission checks in seconds",
        ))?;

        let store_failures = IntCounterVec::new(
            Opts::new(
                "gatekeeper_store_failures_total",
                "Counter store failures by kind",
            ),
            &["kind"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "gatekeeper_store_operation_duration_seconds",
                "Duration of counter store operations in seconds",
            ),
            &["operation"],
        )?;

        let store_healthy = Gauge::new(
            "gatekeeper_store_healthy",
            "1 when the shared counter store is in use, 0 while degraded",
        )?;

        let fallback_buckets = Gauge::new(
            "gatekeeper_fallback_buckets",
            "Number of keys tracked by the local fallback bucket",
        )?;

        // Register all metrics
        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(exempt_requests.clone()))?;
        registry.register(Box::new(fail_open.clone()))?;
        registry.register(Box::new(admission_duration.clone()))?;
        registry.register(Box::new(store_failures.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(store_healthy.clone()))?;
        registry.register(Box::new(fallback_buckets.clone()))?;

        store_healthy.set(1.0);

        Ok(Self {
            registry,
            decisions,
            exempt_requests,
            fail_open,
            admission_duration,
            store_failures,
            store_operation_duration,
            store_healthy,
            fallback_buckets,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an admission decision
    pub fn record_decision(&self, allowed: bool, source: &str) {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.decisions.with_label_values(&[outcome, source]).inc();
    }

    pub fn decision_count(&self, allowed: bool, source: &str) -> u64 {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.decisions.with_label_values(&[outcome, source]).get()
    }

    pub fn record_exempt_request(&self) {
        self.exempt_requests.inc();
    }

    pub fn exempt_count(&self) -> u64 {
        self.exempt_requests.get()
    }

    pub fn record_fail_open(&self) {
        self.fail_open.inc();
    }

    pub fn fail_open_count(&self) -> u64 {
        self.fail_open.get()
    }

    /// Create a timer for measuring admission check duration
    pub fn start_admission_timer(&self) -> prometheus::HistogramTimer {
        self.admission_duration.start_timer()
    }

    pub fn record_store_failure(&self, kind: &str) {
        self.store_failures.with_label_values(&[kind]).inc();
    }

    pub fn record_store_operation_duration(&self, operation: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    pub fn set_store_healthy(&self, healthy: bool) {
        self.store_healthy.set(if healthy { 1.0 } else { 0.0 });
    }

    pub fn set_fallback_buckets(&self, count: usize) {
        self.fallback_buckets.set(count as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_decision(true, "remote");
        metrics.record_decision(false, "fallback");
        metrics.record_exempt_request();
        metrics.record_store_failure("timeout");
        metrics.record_store_operation_duration("ping", 0.001);

        let _timer = metrics.start_admission_timer();

        assert_eq!(metrics.decision_count(true, "remote"), 1);
        assert_eq!(metrics.decision_count(false, "fallback"), 1);
        assert_eq!(metrics.exempt_count(), 1);
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();
        metrics.record_decision(false, "remote");
        metrics.set_store_healthy(false);

        let families = metrics.registry().gather();
        assert!(families.iter().any(|f| f.get_name() == "gatekeeper_decisions_total"));
        assert!(families.iter().any(|f| f.get_name() == "gatekeeper_store_healthy"));
    }
}
