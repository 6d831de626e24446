//! Health checking for real servers.

mod probe;
mod state;

pub use probe::{HealthProbe, NetworkProbe, ProbeError};
pub use state::{HealthStatus, HealthTracker, Transition};
