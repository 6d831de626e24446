//! Health verdicts and transition tracking.

use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;

/// Outcome of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// A change in a server's observed health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub server: SocketAddr,
    /// `None` on the first observation.
    pub from: Option<HealthStatus>,
    pub to: HealthStatus,
}

/// Remembers the last verdict per server so transitions can be reported.
///
/// Reconciliation never reads from this; every cycle decides on fresh probes.
#[derive(Debug, Default)]
pub struct HealthTracker {
    servers: DashMap<SocketAddr, HealthStatus>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a verdict, returning the transition if the status changed.
    pub fn observe(&self, server: SocketAddr, status: HealthStatus) -> Option<Transition> {
        let previous = self.servers.insert(server, status);
        if previous == Some(status) {
            return None;
        }

        match previous {
            None => tracing::info!(server = %server, status = %status, "initial health status"),
            Some(from) => tracing::info!(server = %server, from = %from, to = %status, "health status changed"),
        }

        Some(Transition {
            server,
            from: previous,
            to: status,
        })
    }

    /// Last recorded verdict for a server.
    pub fn status(&self, server: SocketAddr) -> Option<HealthStatus> {
        self.servers.get(&server).map(|s| *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_is_transition() {
        let tracker = HealthTracker::new();
        let server: SocketAddr = "10.0.0.2:6443".parse().unwrap();

        let t = tracker.observe(server, HealthStatus::Healthy).unwrap();
        assert_eq!(t.from, None);
        assert_eq!(t.to, HealthStatus::Healthy);
        assert_eq!(tracker.status(server), Some(HealthStatus::Healthy));
    }

    #[test]
    fn test_repeat_observation_is_quiet() {
        let tracker = HealthTracker::new();
        let server: SocketAddr = "10.0.0.2:6443".parse().unwrap();

        tracker.observe(server, HealthStatus::Unhealthy);
        assert!(tracker.observe(server, HealthStatus::Unhealthy).is_none());
    }

    #[test]
    fn test_flip_reports_both_ends() {
        let tracker = HealthTracker::new();
        let server: SocketAddr = "10.0.0.3:6443".parse().unwrap();

        tracker.observe(server, HealthStatus::Unhealthy);
        let t = tracker.observe(server, HealthStatus::Healthy).unwrap();
        assert_eq!(t.from, Some(HealthStatus::Unhealthy));
        assert_eq!(t.to, HealthStatus::Healthy);
    }

    #[test]
    fn test_status_from_bool() {
        assert!(HealthStatus::from(true).is_healthy());
        assert!(!HealthStatus::from(false).is_healthy());
        assert_eq!(HealthStatus::Unhealthy.to_string(), "unhealthy");
    }
}
