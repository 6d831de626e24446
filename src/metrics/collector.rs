//! Metrics collector using prometheus-client.
//!
//! Provides metrics for reconciliation cycles, health checks and table operations.

use crate::health::HealthStatus;
use crate::table::TableOp;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Labels for per-virtual-server metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VirtualServerLabels {
    pub virtual_server: String,
}

/// Labels for per-real-server metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RealServerLabels {
    pub virtual_server: String,
    pub real_server: String,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub virtual_server: String,
    pub real_server: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Labels for table operation metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TableOpLabels {
    pub virtual_server: String,
    pub operation: String,
    pub result: OpResult,
}

/// Result of a table operation.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OpResult {
    Ok,
    Error,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Completed reconciliation cycles.
    cycles_total: Family<VirtualServerLabels, Counter>,
    /// Cycles that finished with at least one error.
    cycle_errors_total: Family<VirtualServerLabels, Counter>,
    /// Cycle duration histogram (in seconds).
    cycle_duration_seconds: Family<VirtualServerLabels, Histogram>,
    /// Real server health gauge (1 = healthy, 0 = unhealthy).
    real_server_health: Family<RealServerLabels, Gauge>,
    /// Real servers registered after the last cycle.
    registered_real_servers: Family<VirtualServerLabels, Gauge>,
    /// Health check results counter.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// Table operations counter.
    table_operations_total: Family<TableOpLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let cycles_total = Family::<VirtualServerLabels, Counter>::default();
        let cycle_errors_total = Family::<VirtualServerLabels, Counter>::default();
        let cycle_duration_seconds =
            Family::<VirtualServerLabels, Histogram>::new_with_constructor(|| {
                // Buckets: 5ms up to ~20s
                Histogram::new(exponential_buckets(0.005, 2.0, 13))
            });
        let real_server_health = Family::<RealServerLabels, Gauge>::default();
        let registered_real_servers = Family::<VirtualServerLabels, Gauge>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();
        let table_operations_total = Family::<TableOpLabels, Counter>::default();

        registry.register(
            "lvscare_reconcile_cycles",
            "Total number of reconciliation cycles",
            cycles_total.clone(),
        );
        registry.register(
            "lvscare_reconcile_cycle_errors",
            "Reconciliation cycles that recorded at least one error",
            cycle_errors_total.clone(),
        );
        registry.register(
            "lvscare_reconcile_duration_seconds",
            "Reconciliation cycle duration in seconds",
            cycle_duration_seconds.clone(),
        );
        registry.register(
            "lvscare_real_server_health",
            "Real server health status (1=healthy, 0=unhealthy)",
            real_server_health.clone(),
        );
        registry.register(
            "lvscare_registered_real_servers",
            "Real servers registered under the virtual server",
            registered_real_servers.clone(),
        );
        registry.register(
            "lvscare_health_checks",
            "Total number of health checks performed",
            health_checks_total.clone(),
        );
        registry.register(
            "lvscare_table_operations",
            "Total number of virtual server table operations",
            table_operations_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                cycles_total,
                cycle_errors_total,
                cycle_duration_seconds,
                real_server_health,
                registered_real_servers,
                health_checks_total,
                table_operations_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a finished reconciliation cycle.
    ///
    /// `registered` is `None` when the table could not be listed; the gauge
    /// then keeps its last known value.
    pub fn record_cycle(
        &self,
        virtual_server: SocketAddr,
        duration: Duration,
        registered: Option<usize>,
        errors: usize,
    ) {
        let labels = VirtualServerLabels {
            virtual_server: virtual_server.to_string(),
        };
        self.inner.cycles_total.get_or_create(&labels).inc();
        if errors > 0 {
            self.inner.cycle_errors_total.get_or_create(&labels).inc();
        }
        self.inner
            .cycle_duration_seconds
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
        if let Some(registered) = registered {
            self.inner
                .registered_real_servers
                .get_or_create(&labels)
                .set(registered as i64);
        }
    }

    /// Record a health check result and update the health gauge.
    pub fn record_health_check(
        &self,
        virtual_server: SocketAddr,
        real_server: SocketAddr,
        status: HealthStatus,
    ) {
        let healthy = status.is_healthy();
        let labels = HealthCheckLabels {
            virtual_server: virtual_server.to_string(),
            real_server: real_server.to_string(),
            result: if healthy {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();

        let gauge_labels = RealServerLabels {
            virtual_server: virtual_server.to_string(),
            real_server: real_server.to_string(),
        };
        self.inner
            .real_server_health
            .get_or_create(&gauge_labels)
            .set(if healthy { 1 } else { 0 });
    }

    /// Record a table operation outcome.
    pub fn record_table_op(&self, virtual_server: SocketAddr, op: TableOp, ok: bool) {
        let labels = TableOpLabels {
            virtual_server: virtual_server.to_string(),
            operation: op.as_str().to_string(),
            result: if ok { OpResult::Ok } else { OpResult::Error },
        };
        self.inner.table_operations_total.get_or_create(&labels).inc();
    }

    /// Start timing a cycle.
    pub fn start_cycle_timer(&self, virtual_server: SocketAddr) -> CycleTimer {
        CycleTimer {
            collector: self.clone(),
            virtual_server,
            start: Instant::now(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for one reconciliation cycle.
pub struct CycleTimer {
    collector: MetricsCollector,
    virtual_server: SocketAddr,
    start: Instant,
}

impl CycleTimer {
    /// Get the elapsed duration.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the cycle and consume the timer.
    pub fn record(self, registered: Option<usize>, errors: usize) {
        let duration = self.start.elapsed();
        self.collector
            .record_cycle(self.virtual_server, duration, registered, errors);
    }
}
