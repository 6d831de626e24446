//! Metrics collection and exposition.

mod collector;
mod server;

pub use collector::{CycleTimer, MetricsCollector};
pub use server::MetricsServer;
