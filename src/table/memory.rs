//! In-memory virtual server table.
//!
//! Mirrors the semantics of the kernel table without touching it. Used by
//! `--dry-run` and by tests, which can also inject one-shot failures.

use crate::config::Scheduler;
use crate::table::{RealServer, TableError, TableOp, VirtualServer, VirtualServerTable};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Most recent mutations kept in the journal; older entries are dropped.
pub const JOURNAL_CAPACITY: usize = 1024;

/// Virtual server table held in process memory.
#[derive(Debug, Default)]
pub struct MemoryTable {
    services: Mutex<BTreeMap<SocketAddr, Service>>,
    /// Operations that fail once on their next call.
    faults: Mutex<VecDeque<TableOp>>,
    /// Most recent mutations, oldest first, bounded by [`JOURNAL_CAPACITY`].
    journal: Mutex<VecDeque<(TableOp, SocketAddr)>>,
}

#[derive(Debug)]
struct Service {
    scheduler: Scheduler,
    real_servers: BTreeMap<SocketAddr, u32>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with [`TableError::Unavailable`].
    pub fn fail_next(&self, op: TableOp) {
        self.faults.lock().push_back(op);
    }

    /// Whether a virtual server exists at `address`.
    pub fn contains_virtual_server(&self, address: SocketAddr) -> bool {
        self.services.lock().contains_key(&address)
    }

    /// Recent mutations in the order they were applied. No-ops are not
    /// recorded.
    pub fn journal(&self) -> Vec<(TableOp, SocketAddr)> {
        self.journal.lock().iter().copied().collect()
    }

    fn take_fault(&self, op: TableOp) -> Result<(), TableError> {
        let mut faults = self.faults.lock();
        match faults.iter().position(|f| *f == op) {
            Some(idx) => {
                faults.remove(idx);
                Err(TableError::Unavailable(format!("injected {} failure", op)))
            }
            None => Ok(()),
        }
    }

    fn record(&self, op: TableOp, address: SocketAddr) {
        let mut journal = self.journal.lock();
        if journal.len() == JOURNAL_CAPACITY {
            journal.pop_front();
        }
        journal.push_back((op, address));
    }
}

#[async_trait]
impl VirtualServerTable for MemoryTable {
    async fn create_virtual_server(&self, vs: &VirtualServer) -> Result<(), TableError> {
        self.take_fault(TableOp::CreateVirtualServer)?;
        let mut services = self.services.lock();

        if let Some(existing) = services.get(&vs.address) {
            if existing.scheduler == vs.scheduler {
                debug!(virtual_server = %vs.address, "virtual server already exists");
                return Ok(());
            }
            return Err(TableError::VirtualServerConflict {
                address: vs.address,
                existing: existing.scheduler.to_string(),
                requested: vs.scheduler,
            });
        }

        services.insert(
            vs.address,
            Service {
                scheduler: vs.scheduler,
                real_servers: BTreeMap::new(),
            },
        );
        drop(services);

        self.record(TableOp::CreateVirtualServer, vs.address);
        info!(virtual_server = %vs.address, scheduler = %vs.scheduler, "created virtual server");
        Ok(())
    }

    async fn delete_virtual_server(
        &self,
        vs: &VirtualServer,
        force: bool,
    ) -> Result<(), TableError> {
        self.take_fault(TableOp::DeleteVirtualServer)?;

        if self.services.lock().remove(&vs.address).is_none() {
            if force {
                warn!(virtual_server = %vs.address, "virtual server not present, nothing to delete");
                return Ok(());
            }
            return Err(TableError::VirtualServerNotFound(vs.address));
        }

        self.record(TableOp::DeleteVirtualServer, vs.address);
        info!(virtual_server = %vs.address, "deleted virtual server");
        Ok(())
    }

    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), TableError> {
        self.take_fault(TableOp::AddRealServer)?;
        let mut services = self.services.lock();

        let service = services
            .get_mut(&vs.address)
            .ok_or(TableError::VirtualServerNotFound(vs.address))?;

        match service.real_servers.get(&rs.address) {
            Some(&weight) if weight == rs.weight => {
                debug!(virtual_server = %vs.address, real_server = %rs.address, "real server already registered");
                return Ok(());
            }
            Some(&weight) => {
                return Err(TableError::RealServerConflict {
                    address: rs.address,
                    existing: weight,
                    requested: rs.weight,
                });
            }
            None => {
                service.real_servers.insert(rs.address, rs.weight);
            }
        }
        drop(services);

        self.record(TableOp::AddRealServer, rs.address);
        info!(
            virtual_server = %vs.address,
            real_server = %rs.address,
            weight = rs.weight,
            "added real server"
        );
        Ok(())
    }

    async fn remove_real_server(
        &self,
        vs: &VirtualServer,
        rs: &RealServer,
    ) -> Result<(), TableError> {
        self.take_fault(TableOp::RemoveRealServer)?;

        let removed = self
            .services
            .lock()
            .get_mut(&vs.address)
            .and_then(|service| service.real_servers.remove(&rs.address))
            .is_some();

        if !removed {
            warn!(virtual_server = %vs.address, real_server = %rs.address, "real server not registered, nothing to remove");
            return Ok(());
        }

        self.record(TableOp::RemoveRealServer, rs.address);
        info!(virtual_server = %vs.address, real_server = %rs.address, "removed real server");
        Ok(())
    }

    async fn list_real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>, TableError> {
        self.take_fault(TableOp::ListRealServers)?;

        self.services
            .lock()
            .get(&vs.address)
            .map(|service| {
                service
                    .real_servers
                    .iter()
                    .map(|(&address, &weight)| RealServer::new(address, weight))
                    .collect()
            })
            .ok_or(TableError::VirtualServerNotFound(vs.address))
    }
}
