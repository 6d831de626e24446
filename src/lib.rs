//! lvscare - keeps an IPVS virtual server's real servers healthy
//!
//! A care session probes every configured real server on a fixed interval and
//! reconciles the kernel virtual server table so that exactly the healthy ones
//! are registered:
//! - Virtual server lifecycle with optional clean start
//! - TCP, HTTP and HTTPS health probes
//! - Diff-and-apply reconciliation through `ipvsadm` or an in-memory table
//! - Run-once and continuous modes
//! - Prometheus metrics

pub mod care;
pub mod config;
pub mod health;
pub mod metrics;
pub mod table;
pub mod util;

pub use care::{CareController, CareSession};
pub use config::CareConfig;
