//! Fakes shared by the care unit tests.

use crate::care::CareSession;
use crate::config::{HealthCheckConfig, HealthScheme, Scheduler};
use crate::health::{HealthProbe, HealthStatus};
use crate::table::{RealServer, VirtualServer};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Probe whose verdicts are set by the test. Unknown servers are unhealthy.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    verdicts: DashMap<SocketAddr, HealthStatus>,
    delays: DashMap<SocketAddr, Duration>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, server: &str, status: HealthStatus) {
        self.verdicts.insert(server.parse().unwrap(), status);
    }

    /// Make the probe for `server` take `delay` (capped at the check timeout).
    pub fn delay(&self, server: &str, delay: Duration) {
        self.delays.insert(server.parse().unwrap(), delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, server: &RealServer, config: &HealthCheckConfig) -> HealthStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delays.get(&server.address).map(|d| *d);
        if let Some(delay) = delay {
            if delay >= config.timeout {
                tokio::time::sleep(config.timeout).await;
                return HealthStatus::Unhealthy;
            }
            tokio::time::sleep(delay).await;
        }

        self.verdicts
            .get(&server.address)
            .map(|s| *s)
            .unwrap_or(HealthStatus::Unhealthy)
    }
}

pub fn rs(addr: &str, weight: u32) -> RealServer {
    RealServer::new(addr.parse().unwrap(), weight)
}

pub fn session(real_servers: Vec<RealServer>) -> CareSession {
    CareSession {
        virtual_server: VirtualServer::new("10.0.0.1:6443".parse().unwrap(), Scheduler::Rr),
        real_servers,
        health_check: HealthCheckConfig {
            scheme: HealthScheme::Https,
            path: "/healthz".to_string(),
            timeout: Duration::from_millis(500),
            expected_status: None,
        },
        interval: Duration::from_secs(5),
        run_once: false,
        clean: false,
    }
}
