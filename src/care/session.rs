//! The unit of configuration for one controller run.

use crate::config::{CareConfig, HealthCheckConfig};
use crate::table::{RealServer, VirtualServer};
use std::time::Duration;

/// Everything a care loop needs to know about what it is looking after.
///
/// Passed explicitly to every component; nothing about the active session
/// lives in process-wide state.
#[derive(Debug, Clone)]
pub struct CareSession {
    pub virtual_server: VirtualServer,
    /// Desired real servers, in configuration order.
    pub real_servers: Vec<RealServer>,
    pub health_check: HealthCheckConfig,
    pub interval: Duration,
    pub run_once: bool,
    /// Delete the virtual server before creating it.
    pub clean: bool,
}

impl From<&CareConfig> for CareSession {
    fn from(config: &CareConfig) -> Self {
        Self {
            virtual_server: VirtualServer::from(&config.virtual_server),
            real_servers: config.real_servers.iter().map(RealServer::from).collect(),
            health_check: config.health_check.clone(),
            interval: config.interval,
            run_once: config.run_once,
            clean: config.clean,
        }
    }
}
