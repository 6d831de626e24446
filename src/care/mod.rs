//! The care loop: keeps one virtual server's real servers in line with
//! their health.

mod controller;
mod reconciler;
mod session;

#[cfg(test)]
mod test_support;

pub use controller::{CareController, CareError, CareState, CareSummary};
pub use reconciler::{plan, CycleReport, ReconcileError, ReconcilePlan, Reconciler};
pub use session::CareSession;
