//! Diff-and-apply reconciliation of one virtual server.

use crate::care::CareSession;
use crate::health::{HealthProbe, HealthStatus, HealthTracker};
use crate::metrics::{CycleTimer, MetricsCollector};
use crate::table::{RealServer, TableError, TableOp, VirtualServerTable};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A table operation that failed during a cycle.
#[derive(Debug, Error)]
#[error("{op} for {target} failed: {source}")]
pub struct ReconcileError {
    pub op: TableOp,
    /// Real server (or virtual server, for listing) the operation targeted.
    pub target: SocketAddr,
    #[source]
    pub source: TableError,
}

/// Mutations needed to move the table from `current` to `target`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Applied first. Includes the old entry of every weight change.
    pub remove: Vec<RealServer>,
    pub add: Vec<RealServer>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Every configured real server with its verdict for this cycle.
    pub probes: Vec<(RealServer, HealthStatus)>,
    pub added: Vec<RealServer>,
    pub removed: Vec<RealServer>,
    pub errors: Vec<ReconcileError>,
    /// Registered real servers once the cycle's mutations were applied,
    /// `None` if the table could not be listed.
    pub registered: Option<usize>,
}

impl CycleReport {
    /// True when every table operation of the cycle succeeded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Real servers that passed their probe this cycle.
    pub fn healthy(&self) -> impl Iterator<Item = &RealServer> {
        self.probes
            .iter()
            .filter(|(_, status)| status.is_healthy())
            .map(|(rs, _)| rs)
    }
}

/// Compute the removals and additions that turn `current` into `target`.
///
/// Servers are matched by address. A server present in both with a
/// different weight is removed and re-added, since the table has no update
/// primitive. On duplicate target addresses the first entry wins.
pub fn plan(target: &[RealServer], current: &[RealServer]) -> ReconcilePlan {
    let mut wanted: BTreeMap<SocketAddr, u32> = BTreeMap::new();
    for rs in target {
        wanted.entry(rs.address).or_insert(rs.weight);
    }

    let registered: BTreeMap<SocketAddr, u32> =
        current.iter().map(|rs| (rs.address, rs.weight)).collect();

    let remove = registered
        .iter()
        .filter(|(addr, weight)| wanted.get(*addr) != Some(*weight))
        .map(|(&addr, &weight)| RealServer::new(addr, weight))
        .collect();

    let add = wanted
        .iter()
        .filter(|(addr, weight)| registered.get(*addr) != Some(*weight))
        .map(|(&addr, &weight)| RealServer::new(addr, weight))
        .collect();

    ReconcilePlan { remove, add }
}

/// Probes configured real servers and applies the difference to the table.
pub struct Reconciler {
    table: Arc<dyn VirtualServerTable>,
    probe: Arc<dyn HealthProbe>,
    tracker: HealthTracker,
    metrics: Option<MetricsCollector>,
}

impl Reconciler {
    pub fn new(table: Arc<dyn VirtualServerTable>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            table,
            probe,
            tracker: HealthTracker::new(),
            metrics: None,
        }
    }

    /// Record cycle, probe and table metrics into `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one reconciliation cycle for `session`.
    ///
    /// Never fails as a whole: individual table errors are collected in the
    /// report and the remaining operations still run.
    pub async fn reconcile(&self, session: &CareSession) -> CycleReport {
        let vs = &session.virtual_server;
        let timer = self
            .metrics
            .as_ref()
            .map(|m| m.start_cycle_timer(vs.address));

        let mut report = CycleReport {
            probes: self.probe_all(session).await,
            ..Default::default()
        };

        let target: Vec<RealServer> = report.healthy().copied().collect();

        let current = match self.table.list_real_servers(vs).await {
            Ok(current) => {
                self.record_op(vs.address, TableOp::ListRealServers, true);
                current
            }
            Err(e) => {
                self.record_op(vs.address, TableOp::ListRealServers, false);
                warn!(virtual_server = %vs.address, error = %e, "failed to list real servers, skipping cycle");
                report.errors.push(ReconcileError {
                    op: TableOp::ListRealServers,
                    target: vs.address,
                    source: e,
                });
                self.finish(timer, session, &report);
                return report;
            }
        };

        let plan = plan(&target, &current);
        let mut registered = current.len();

        for rs in plan.remove {
            match self.table.remove_real_server(vs, &rs).await {
                Ok(()) => {
                    self.record_op(vs.address, TableOp::RemoveRealServer, true);
                    registered -= 1;
                    report.removed.push(rs);
                }
                Err(e) => {
                    self.record_op(vs.address, TableOp::RemoveRealServer, false);
                    warn!(virtual_server = %vs.address, real_server = %rs.address, error = %e, "failed to remove real server");
                    report.errors.push(ReconcileError {
                        op: TableOp::RemoveRealServer,
                        target: rs.address,
                        source: e,
                    });
                }
            }
        }

        for rs in plan.add {
            match self.table.add_real_server(vs, &rs).await {
                Ok(()) => {
                    self.record_op(vs.address, TableOp::AddRealServer, true);
                    registered += 1;
                    report.added.push(rs);
                }
                Err(e) => {
                    self.record_op(vs.address, TableOp::AddRealServer, false);
                    warn!(virtual_server = %vs.address, real_server = %rs.address, error = %e, "failed to add real server");
                    report.errors.push(ReconcileError {
                        op: TableOp::AddRealServer,
                        target: rs.address,
                        source: e,
                    });
                }
            }
        }

        report.registered = Some(registered);
        self.finish(timer, session, &report);
        report
    }

    /// Probe every configured real server concurrently.
    async fn probe_all(&self, session: &CareSession) -> Vec<(RealServer, HealthStatus)> {
        let checks = session.real_servers.iter().map(|rs| async move {
            let status = self.probe.check(rs, &session.health_check).await;
            (*rs, status)
        });
        let verdicts = join_all(checks).await;

        for (rs, status) in &verdicts {
            self.tracker.observe(rs.address, *status);
            if let Some(metrics) = &self.metrics {
                metrics.record_health_check(session.virtual_server.address, rs.address, *status);
            }
        }

        verdicts
    }

    fn record_op(&self, virtual_server: SocketAddr, op: TableOp, ok: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_table_op(virtual_server, op, ok);
        }
    }

    fn finish(
        &self,
        timer: Option<CycleTimer>,
        session: &CareSession,
        report: &CycleReport,
    ) {
        let vs = session.virtual_server.address;
        let healthy = report.healthy().count();

        if !report.is_clean() {
            warn!(
                virtual_server = %vs,
                healthy,
                added = report.added.len(),
                removed = report.removed.len(),
                errors = report.errors.len(),
                "reconciliation cycle finished with errors"
            );
        } else if !report.added.is_empty() || !report.removed.is_empty() {
            info!(
                virtual_server = %vs,
                healthy,
                added = report.added.len(),
                removed = report.removed.len(),
                "reconciled real servers"
            );
        } else {
            debug!(virtual_server = %vs, healthy, "real servers already in sync");
        }

        if let Some(timer) = timer {
            timer.record(report.registered, report.errors.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::care::test_support::{rs, session, ScriptedProbe};
    use crate::table::{MemoryTable, VirtualServerTable};
    use std::time::Duration;

    async fn setup(
        real_servers: Vec<RealServer>,
    ) -> (Arc<MemoryTable>, Arc<ScriptedProbe>, Reconciler, CareSession) {
        let table = Arc::new(MemoryTable::new());
        let probe = Arc::new(ScriptedProbe::new());
        let session = session(real_servers);
        table
            .create_virtual_server(&session.virtual_server)
            .await
            .unwrap();
        let reconciler = Reconciler::new(table.clone(), probe.clone());
        (table, probe, reconciler, session)
    }

    #[test]
    fn test_plan_add_and_remove() {
        let target = vec![rs("10.0.0.2:6443", 1), rs("10.0.0.3:6443", 1)];
        let current = vec![rs("10.0.0.3:6443", 1), rs("10.0.0.4:6443", 1)];

        let plan = plan(&target, &current);
        assert_eq!(plan.add, vec![rs("10.0.0.2:6443", 1)]);
        assert_eq!(plan.remove, vec![rs("10.0.0.4:6443", 1)]);
    }

    #[test]
    fn test_plan_weight_change_is_remove_then_add() {
        let plan = plan(&[rs("10.0.0.2:6443", 5)], &[rs("10.0.0.2:6443", 1)]);
        assert_eq!(plan.remove, vec![rs("10.0.0.2:6443", 1)]);
        assert_eq!(plan.add, vec![rs("10.0.0.2:6443", 5)]);
    }

    #[test]
    fn test_plan_in_sync_is_empty() {
        let servers = vec![rs("10.0.0.2:6443", 1), rs("10.0.0.3:6443", 2)];
        assert!(plan(&servers, &servers).is_empty());
    }

    #[test]
    fn test_plan_empty_target_drains() {
        let current = vec![rs("10.0.0.2:6443", 1), rs("10.0.0.3:6443", 1)];
        let plan = plan(&[], &current);
        assert_eq!(plan.remove, current);
        assert!(plan.add.is_empty());
    }

    #[test]
    fn test_plan_duplicate_target_first_wins() {
        let plan = plan(&[rs("10.0.0.2:6443", 1), rs("10.0.0.2:6443", 9)], &[]);
        assert_eq!(plan.add, vec![rs("10.0.0.2:6443", 1)]);
    }

    #[tokio::test]
    async fn test_registers_only_healthy() {
        let (table, probe, reconciler, session) =
            setup(vec![rs("10.0.0.2:6443", 1), rs("10.0.0.3:6443", 1)]).await;
        probe.set("10.0.0.2:6443", HealthStatus::Healthy);
        probe.set("10.0.0.3:6443", HealthStatus::Unhealthy);

        let report = reconciler.reconcile(&session).await;

        assert!(report.is_clean());
        assert_eq!(report.added, vec![rs("10.0.0.2:6443", 1)]);
        assert_eq!(report.registered, Some(1));
        assert_eq!(
            table.list_real_servers(&session.virtual_server).await.unwrap(),
            vec![rs("10.0.0.2:6443", 1)]
        );
    }

    #[tokio::test]
    async fn test_all_unhealthy_drains() {
        let (table, probe, reconciler, session) =
            setup(vec![rs("10.0.0.2:6443", 1), rs("10.0.0.3:6443", 1)]).await;
        probe.set("10.0.0.2:6443", HealthStatus::Healthy);
        probe.set("10.0.0.3:6443", HealthStatus::Healthy);
        reconciler.reconcile(&session).await;

        probe.set("10.0.0.2:6443", HealthStatus::Unhealthy);
        probe.set("10.0.0.3:6443", HealthStatus::Unhealthy);
        let report = reconciler.reconcile(&session).await;

        assert_eq!(report.removed.len(), 2);
        assert!(table.contains_virtual_server(session.virtual_server.address));
        assert!(table
            .list_real_servers(&session.virtual_server)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_configuration_drains() {
        let (table, _probe, reconciler, mut session) = setup(vec![]).await;
        table
            .add_real_server(&session.virtual_server, &rs("10.0.0.7:6443", 1))
            .await
            .unwrap();

        session.real_servers.clear();
        let report = reconciler.reconcile(&session).await;

        assert_eq!(report.removed, vec![rs("10.0.0.7:6443", 1)]);
        assert_eq!(report.registered, Some(0));
    }

    #[tokio::test]
    async fn test_weight_change_removes_before_adding() {
        let (table, probe, reconciler, mut session) = setup(vec![rs("10.0.0.2:6443", 1)]).await;
        probe.set("10.0.0.2:6443", HealthStatus::Healthy);
        reconciler.reconcile(&session).await;

        session.real_servers = vec![rs("10.0.0.2:6443", 4)];
        let report = reconciler.reconcile(&session).await;

        assert!(report.is_clean());
        let journal = table.journal();
        let tail: Vec<TableOp> = journal.iter().rev().take(2).rev().map(|(op, _)| *op).collect();
        assert_eq!(tail, vec![TableOp::RemoveRealServer, TableOp::AddRealServer]);
        assert_eq!(
            table.list_real_servers(&session.virtual_server).await.unwrap(),
            vec![rs("10.0.0.2:6443", 4)]
        );
    }

    #[tokio::test]
    async fn test_failed_add_does_not_abort_batch() {
        let (table, probe, reconciler, session) =
            setup(vec![rs("10.0.0.2:6443", 1), rs("10.0.0.3:6443", 1)]).await;
        probe.set("10.0.0.2:6443", HealthStatus::Healthy);
        probe.set("10.0.0.3:6443", HealthStatus::Healthy);
        table.fail_next(TableOp::AddRealServer);

        let report = reconciler.reconcile(&session).await;

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].op, TableOp::AddRealServer);
        assert_eq!(report.added.len(), 1);
        assert_eq!(report.registered, Some(1));

        // next cycle repairs the gap
        let report = reconciler.reconcile(&session).await;
        assert!(report.is_clean());
        assert_eq!(
            table.list_real_servers(&session.virtual_server).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_list_failure_skips_mutations() {
        let (table, probe, reconciler, session) = setup(vec![rs("10.0.0.2:6443", 1)]).await;
        probe.set("10.0.0.2:6443", HealthStatus::Healthy);
        table.fail_next(TableOp::ListRealServers);

        let report = reconciler.reconcile(&session).await;

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].op, TableOp::ListRealServers);
        assert!(report.added.is_empty());
        assert_eq!(report.registered, None);
        assert_eq!(table.journal().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_virtual_server_is_reported() {
        let table = Arc::new(MemoryTable::new());
        let probe = Arc::new(ScriptedProbe::new());
        let reconciler = Reconciler::new(table, probe);

        let report = reconciler.reconcile(&session(vec![rs("10.0.0.2:6443", 1)])).await;
        assert!(matches!(
            report.errors[0].source,
            TableError::VirtualServerNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_slow_probe_does_not_affect_others() {
        let (table, probe, reconciler, session) =
            setup(vec![rs("10.0.0.2:6443", 1), rs("10.0.0.3:6443", 1)]).await;
        probe.set("10.0.0.2:6443", HealthStatus::Healthy);
        probe.set("10.0.0.3:6443", HealthStatus::Healthy);
        probe.delay("10.0.0.3:6443", Duration::from_secs(60));

        let report = reconciler.reconcile(&session).await;

        assert_eq!(report.probes.len(), 2);
        assert_eq!(report.added, vec![rs("10.0.0.2:6443", 1)]);
        assert_eq!(probe.calls(), 2);
        assert_eq!(
            table.list_real_servers(&session.virtual_server).await.unwrap(),
            vec![rs("10.0.0.2:6443", 1)]
        );
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let (_table, probe, reconciler, session) = setup(vec![rs("10.0.0.2:6443", 1)]).await;
        let metrics = MetricsCollector::new();
        let reconciler = reconciler.with_metrics(metrics.clone());
        probe.set("10.0.0.2:6443", HealthStatus::Healthy);

        reconciler.reconcile(&session).await;

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, metrics.registry()).unwrap();
        assert!(out.contains("lvscare_reconcile_cycles_total"));
        assert!(out.contains("operation=\"add_real_server\",result=\"Ok\""));
    }

    #[tokio::test]
    async fn test_list_failure_keeps_registered_gauge() {
        let (table, probe, reconciler, session) = setup(vec![rs("10.0.0.2:6443", 1)]).await;
        let metrics = MetricsCollector::new();
        let reconciler = reconciler.with_metrics(metrics.clone());
        probe.set("10.0.0.2:6443", HealthStatus::Healthy);
        reconciler.reconcile(&session).await;

        table.fail_next(TableOp::ListRealServers);
        let report = reconciler.reconcile(&session).await;
        assert_eq!(report.registered, None);

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, metrics.registry()).unwrap();
        assert!(out.contains(
            "lvscare_registered_real_servers{virtual_server=\"10.0.0.1:6443\"} 1"
        ));
        assert!(out.contains(
            "lvscare_reconcile_cycle_errors_total{virtual_server=\"10.0.0.1:6443\"} 1"
        ));
    }
}
