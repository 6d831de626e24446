//! Session lifecycle: clean start, initial pass, then periodic care.

use crate::care::{CareSession, CycleReport, Reconciler};
use crate::health::HealthProbe;
use crate::metrics::MetricsCollector;
use crate::table::{TableError, VirtualServerTable};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CareState {
    Initializing,
    Reconciling,
    /// Waiting for the next tick.
    Idle,
    Terminated,
}

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum CareError {
    #[error("failed to create virtual server {address}: {source}")]
    CreateVirtualServer {
        address: SocketAddr,
        #[source]
        source: TableError,
    },
}

/// What a finished session did.
#[derive(Debug)]
pub struct CareSummary {
    /// Reconciliation cycles run, initial pass included.
    pub cycles: u64,
    pub last_report: CycleReport,
}

/// Drives one [`CareSession`] from start to termination.
pub struct CareController {
    session: CareSession,
    table: Arc<dyn VirtualServerTable>,
    reconciler: Reconciler,
    state: watch::Sender<CareState>,
}

impl CareController {
    pub fn new(
        session: CareSession,
        table: Arc<dyn VirtualServerTable>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let (state, _) = watch::channel(CareState::Initializing);
        Self {
            reconciler: Reconciler::new(Arc::clone(&table), probe),
            session,
            table,
            state,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.reconciler = self.reconciler.with_metrics(metrics);
        self
    }

    pub fn session(&self) -> &CareSession {
        &self.session
    }

    /// Receive lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<CareState> {
        self.state.subscribe()
    }

    /// Run the session until it terminates.
    ///
    /// In continuous mode this returns after a message (or close) on
    /// `shutdown`; a cycle already in progress completes first.
    pub async fn run(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<CareSummary, CareError> {
        let vs = self.session.virtual_server;
        self.state.send_replace(CareState::Initializing);

        if self.session.clean {
            if let Err(e) = self.table.delete_virtual_server(&vs, true).await {
                warn!(virtual_server = %vs, error = %e, "clean start could not delete virtual server");
            }
        }

        if let Err(source) = self.table.create_virtual_server(&vs).await {
            error!(virtual_server = %vs, error = %source, "failed to create virtual server");
            self.state.send_replace(CareState::Terminated);
            return Err(CareError::CreateVirtualServer {
                address: vs.address,
                source,
            });
        }

        info!(
            virtual_server = %vs,
            scheduler = %vs.scheduler,
            real_servers = self.session.real_servers.len(),
            interval = ?self.session.interval,
            run_once = self.session.run_once,
            "care session started"
        );

        let mut cycles = 1;
        let mut last_report = self.cycle().await;

        if self.session.run_once {
            info!(virtual_server = %vs, "run-once pass finished");
            self.state.send_replace(CareState::Terminated);
            return Ok(CareSummary {
                cycles,
                last_report,
            });
        }

        let period = self.session.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!(virtual_server = %vs, cycles, "care loop stopping");
                    break;
                }

                _ = ticker.tick() => {
                    last_report = self.cycle().await;
                    cycles += 1;
                }
            }
        }

        self.state.send_replace(CareState::Terminated);
        Ok(CareSummary {
            cycles,
            last_report,
        })
    }

    async fn cycle(&self) -> CycleReport {
        self.state.send_replace(CareState::Reconciling);
        let report = self.reconciler.reconcile(&self.session).await;
        self.state.send_replace(CareState::Idle);
        report
    }
}
