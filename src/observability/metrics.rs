use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Central registry for all Prometheus metrics. Names track the
/// propagation-core stages named in `spec.md` §2's control-flow summary
/// (verify → dedup/persist → parse → execute → dispatch) rather than a
/// generic ingest/persist/sync/enrichment family set.
pub struct MetricsRegistry {
    registry: Registry,

    pub actions_received_total: IntCounter,
    pub actions_duplicate_total: IntCounter,
    pub verification_failures_total: IntCounter,
    pub syntax_errors_total: IntCounter,

    pub executor_duration_seconds: Histogram,
    pub executor_errors_total: IntCounter,

    pub dispatch_attempts_total: IntCounter,
    pub dispatch_failures_total: IntCounter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let actions_received_total = IntCounter::with_opts(
            Opts::new("propolis_actions_received_total", "Total actions accepted past verification and dedup")
                .namespace("propolis"),
        )
        .unwrap();

        let actions_duplicate_total = IntCounter::with_opts(
            Opts::new("propolis_actions_duplicate_total", "Total publish requests rejected as duplicates")
                .namespace("propolis"),
        )
        .unwrap();

        let verification_failures_total = IntCounter::with_opts(
            Opts::new("propolis_verification_failures_total", "Total signature verification failures")
                .namespace("propolis"),
        )
        .unwrap();

        let syntax_errors_total = IntCounter::with_opts(
            Opts::new("propolis_syntax_errors_total", "Total statements rejected by the lexer/parser")
                .namespace("propolis"),
        )
        .unwrap();

        let executor_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("propolis_executor_duration_seconds", "Graph executor transaction duration")
                .namespace("propolis")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();

        let executor_errors_total = IntCounter::with_opts(
            Opts::new("propolis_executor_errors_total", "Total executor faults (including multi-match)")
                .namespace("propolis"),
        )
        .unwrap();

        let dispatch_attempts_total = IntCounter::with_opts(
            Opts::new("propolis_dispatch_attempts_total", "Total peer fan-out dispatch attempts").namespace("propolis"),
        )
        .unwrap();

        let dispatch_failures_total = IntCounter::with_opts(
            Opts::new("propolis_dispatch_failures_total", "Total peer fan-out dispatch failures").namespace("propolis"),
        )
        .unwrap();

        for metric in [
            Box::new(actions_received_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(actions_duplicate_total.clone()),
            Box::new(verification_failures_total.clone()),
            Box::new(syntax_errors_total.clone()),
            Box::new(executor_duration_seconds.clone()),
            Box::new(executor_errors_total.clone()),
            Box::new(dispatch_attempts_total.clone()),
            Box::new(dispatch_failures_total.clone()),
        ] {
            registry.register(metric).unwrap();
        }

        Self {
            registry,
            actions_received_total,
            actions_duplicate_total,
            verification_failures_total,
            syntax_errors_total,
            executor_duration_seconds,
            executor_errors_total,
            dispatch_attempts_total,
            dispatch_failures_total,
        }
    }

    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        match encoder.encode_to_string(&metric_families) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Failed to encode metrics: {}", e);
                String::new()
            }
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
    Ok(Arc::new(MetricsRegistry::new()))
}

#[cfg(feature = "unit-tests")]
mod tests {
    #[test]
    fn metrics_registry_creation() {
        let registry = super::MetricsRegistry::new();
        assert!(!registry.encode().is_empty());
    }

    #[test]
    fn metrics_increment() {
        let registry = super::MetricsRegistry::new();
        registry.actions_received_total.inc();
        registry.executor_duration_seconds.observe(0.01);
        assert!(!registry.encode().is_empty());
    }
}
