//! Virtual server table access.
//!
//! Every mutation of the kernel load-balancing table goes through a
//! [`VirtualServerTable`]. Two implementations are provided: [`IpvsadmTable`]
//! drives the real IPVS table through `ipvsadm`, and [`MemoryTable`] keeps
//! an in-process copy with the same semantics.

mod ipvsadm;
mod memory;

pub use ipvsadm::IpvsadmTable;
pub use memory::MemoryTable;

use crate::config::{Scheduler, ServerConfig, VirtualServerConfig};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// A load-balanced endpoint, identified by its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualServer {
    pub address: SocketAddr,
    pub scheduler: Scheduler,
}

impl VirtualServer {
    pub fn new(address: SocketAddr, scheduler: Scheduler) -> Self {
        Self { address, scheduler }
    }
}

impl From<&VirtualServerConfig> for VirtualServer {
    fn from(config: &VirtualServerConfig) -> Self {
        Self::new(config.address, config.scheduler)
    }
}

impl fmt::Display for VirtualServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// A backend registered (or registrable) under a virtual server.
///
/// Set operations key real servers by address; the weight is an attribute
/// of the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RealServer {
    pub address: SocketAddr,
    pub weight: u32,
}

impl RealServer {
    pub fn new(address: SocketAddr, weight: u32) -> Self {
        Self { address, weight }
    }
}

impl From<&ServerConfig> for RealServer {
    fn from(config: &ServerConfig) -> Self {
        Self::new(config.address, config.weight)
    }
}

impl fmt::Display for RealServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Table operations, used for error reporting and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableOp {
    CreateVirtualServer,
    DeleteVirtualServer,
    AddRealServer,
    RemoveRealServer,
    ListRealServers,
}

impl TableOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableOp::CreateVirtualServer => "create_virtual_server",
            TableOp::DeleteVirtualServer => "delete_virtual_server",
            TableOp::AddRealServer => "add_real_server",
            TableOp::RemoveRealServer => "remove_real_server",
            TableOp::ListRealServers => "list_real_servers",
        }
    }
}

impl fmt::Display for TableOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by table implementations.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("virtual server {0} does not exist")]
    VirtualServerNotFound(SocketAddr),

    #[error("virtual server {address} already exists with scheduler {existing} (requested {requested})")]
    VirtualServerConflict {
        address: SocketAddr,
        existing: String,
        requested: Scheduler,
    },

    #[error("real server {address} is already registered with weight {existing} (requested {requested})")]
    RealServerConflict {
        address: SocketAddr,
        existing: u32,
        requested: u32,
    },

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to parse ipvsadm output: {0}")]
    Parse(String),

    #[error("table unavailable: {0}")]
    Unavailable(String),
}

/// Mutation boundary over the kernel virtual server table.
///
/// All operations are idempotent in the sense described on each method, so
/// a caller can retry a whole cycle without tracking what already happened.
#[async_trait]
pub trait VirtualServerTable: Send + Sync {
    /// Create `vs`. Succeeds silently if it already exists with the same
    /// scheduler; fails with [`TableError::VirtualServerConflict`] otherwise.
    async fn create_virtual_server(&self, vs: &VirtualServer) -> Result<(), TableError>;

    /// Delete `vs` and all of its real servers. A missing virtual server is a
    /// warning when `force` is set and [`TableError::VirtualServerNotFound`]
    /// when it is not.
    async fn delete_virtual_server(&self, vs: &VirtualServer, force: bool)
        -> Result<(), TableError>;

    /// Register `rs` under `vs`. Registering the same address and weight
    /// twice is a no-op; the same address with another weight is a conflict.
    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer)
        -> Result<(), TableError>;

    /// Unregister the real server at `rs.address`. Absent entries are a no-op.
    async fn remove_real_server(&self, vs: &VirtualServer, rs: &RealServer)
        -> Result<(), TableError>;

    /// Real servers currently registered under `vs`.
    async fn list_real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>, TableError>;
}
