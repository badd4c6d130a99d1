//! Prometheus metrics for proxy-manager.

use healthcheck::{HealthCheckResult, HealthStatistics, ResultObserver};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use reconciler::ReconcileResult;

/// Labels for reconcile outcome metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// Terminal state (committed, rolled_back, aborted)
    pub outcome: String,
}

/// Labels for rule mutation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MutationLabels {
    /// Operation (add, update, delete, restore)
    pub op: String,
}

/// Labels for probe result metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    /// Probe verdict (healthy, unhealthy)
    pub status: String,
}

/// Labels for state-based metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    /// State (healthy, unhealthy, unknown)
    pub state: String,
}

/// Metrics registry with all proxy-manager metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    reconciles_total: Family<OutcomeLabels, Counter>,
    reconcile_duration_seconds: Histogram,
    rule_mutations_total: Family<MutationLabels, Counter>,
    health_checks_total: Family<StatusLabels, Counter>,
    backends: Family<StateLabels, Gauge>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        // Counters are exposed with a `_total` suffix
        let reconciles_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "proxy_manager_reconciles",
            "Reconcile invocations by terminal state",
            reconciles_total.clone(),
        );

        // 5ms to ~20s
        let reconcile_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 12));
        registry.register(
            "proxy_manager_reconcile_duration_seconds",
            "Reconcile pipeline duration in seconds",
            reconcile_duration_seconds.clone(),
        );

        let rule_mutations_total = Family::<MutationLabels, Counter>::default();
        registry.register(
            "proxy_manager_rule_mutations",
            "Successful rule store mutations",
            rule_mutations_total.clone(),
        );

        let health_checks_total = Family::<StatusLabels, Counter>::default();
        registry.register(
            "proxy_manager_health_checks",
            "Backend probes performed",
            health_checks_total.clone(),
        );

        let backends = Family::<StateLabels, Gauge>::default();
        registry.register(
            "proxy_manager_backends",
            "Enabled backends by health state",
            backends.clone(),
        );

        Self {
            registry,
            reconciles_total,
            reconcile_duration_seconds,
            rule_mutations_total,
            health_checks_total,
            backends,
        }
    }

    /// Record the outcome of a reconcile
    pub fn record_reconcile(&self, result: &ReconcileResult) {
        self.reconciles_total
            .get_or_create(&OutcomeLabels {
                outcome: result.state.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds
            .observe(result.duration_ms as f64 / 1000.0);
    }

    /// Record a successful rule mutation
    pub fn record_mutation(&self, op: &str) {
        self.rule_mutations_total
            .get_or_create(&MutationLabels { op: op.to_string() })
            .inc();
    }

    /// Refresh backend gauges from current statistics
    pub fn update_backends(&self, stats: &HealthStatistics) {
        for (state, count) in [
            ("healthy", stats.healthy),
            ("unhealthy", stats.unhealthy),
            ("unknown", stats.unknown),
        ] {
            self.backends
                .get_or_create(&StateLabels {
                    state: state.to_string(),
                })
                .set(count as i64);
        }
    }

    /// Encode in Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultObserver for MetricsRegistry {
    fn observe(&self, result: &HealthCheckResult) {
        self.health_checks_total
            .get_or_create(&StatusLabels {
                status: result.status.to_string(),
            })
            .inc();
    }
}
