//! Kernel-backed virtual server table driven through `ipvsadm`.
//!
//! Each operation reads the current listing (`ipvsadm -Ln`) to decide
//! whether a mutation is needed, then issues at most one mutating command.

use crate::config::{ForwardMethod, IpvsConfig};
use crate::table::{RealServer, TableError, VirtualServer, VirtualServerTable};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Virtual server table backed by the kernel IPVS table.
#[derive(Debug, Clone)]
pub struct IpvsadmTable {
    /// Path of the ipvsadm binary.
    binary: PathBuf,
    /// Forwarding method for newly added real servers.
    forward_method: ForwardMethod,
}

/// One service block of an `ipvsadm -Ln` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServiceEntry {
    pub protocol: String,
    pub address: SocketAddr,
    pub scheduler: String,
    pub real_servers: Vec<RealServer>,
}

impl IpvsadmTable {
    /// Create a table using the binary and forwarding method from `config`.
    pub fn new(config: &IpvsConfig) -> Self {
        Self {
            binary: config.ipvsadm_path.clone(),
            forward_method: config.forward_method,
        }
    }

    /// Run ipvsadm with `args`, returning stdout on success.
    async fn run(&self, args: &[String]) -> Result<String, TableError> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        debug!(command = %command, "running ipvsadm");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|source| TableError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TableError::Command {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Look up the TCP service at `address`.
    async fn service(&self, address: SocketAddr) -> Result<Option<ServiceEntry>, TableError> {
        let listing = self.run(&["-L".to_string(), "-n".to_string()]).await?;
        let services = parse_listing(&listing)?;

        Ok(services
            .into_iter()
            .find(|s| s.protocol == "TCP" && s.address == address))
    }
}

#[async_trait]
impl VirtualServerTable for IpvsadmTable {
    async fn create_virtual_server(&self, vs: &VirtualServer) -> Result<(), TableError> {
        if let Some(existing) = self.service(vs.address).await? {
            if existing.scheduler == vs.scheduler.as_str() {
                debug!(virtual_server = %vs.address, "virtual server already exists");
                return Ok(());
            }
            return Err(TableError::VirtualServerConflict {
                address: vs.address,
                existing: existing.scheduler,
                requested: vs.scheduler,
            });
        }

        self.run(&[
            "-A".to_string(),
            "-t".to_string(),
            vs.address.to_string(),
            "-s".to_string(),
            vs.scheduler.to_string(),
        ])
        .await?;

        info!(virtual_server = %vs.address, scheduler = %vs.scheduler, "created virtual server");
        Ok(())
    }

    async fn delete_virtual_server(
        &self,
        vs: &VirtualServer,
        force: bool,
    ) -> Result<(), TableError> {
        if self.service(vs.address).await?.is_none() {
            if force {
                warn!(virtual_server = %vs.address, "virtual server not present, nothing to delete");
                return Ok(());
            }
            return Err(TableError::VirtualServerNotFound(vs.address));
        }

        self.run(&["-D".to_string(), "-t".to_string(), vs.address.to_string()])
            .await?;

        info!(virtual_server = %vs.address, "deleted virtual server");
        Ok(())
    }

    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), TableError> {
        let service = self
            .service(vs.address)
            .await?
            .ok_or(TableError::VirtualServerNotFound(vs.address))?;

        if let Some(existing) = service.real_servers.iter().find(|r| r.address == rs.address) {
            if existing.weight == rs.weight {
                debug!(virtual_server = %vs.address, real_server = %rs.address, "real server already registered");
                return Ok(());
            }
            return Err(TableError::RealServerConflict {
                address: rs.address,
                existing: existing.weight,
                requested: rs.weight,
            });
        }

        self.run(&[
            "-a".to_string(),
            "-t".to_string(),
            vs.address.to_string(),
            "-r".to_string(),
            rs.address.to_string(),
            self.forward_method.ipvsadm_flag().to_string(),
            "-w".to_string(),
            rs.weight.to_string(),
        ])
        .await?;

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
        let registered = self
            .service(vs.address)
            .await?
            .is_some_and(|s| s.real_servers.iter().any(|r| r.address == rs.address));

        if !registered {
            warn!(virtual_server = %vs.address, real_server = %rs.address, "real server not registered, nothing to remove");
            return Ok(());
        }

        self.run(&[
            "-d".to_string(),
            "-t".to_string(),
            vs.address.to_string(),
            "-r".to_string(),
            rs.address.to_string(),
        ])
        .await?;

        info!(virtual_server = %vs.address, real_server = %rs.address, "removed real server");
        Ok(())
    }

    async fn list_real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>, TableError> {
        self.service(vs.address)
            .await?
            .map(|s| s.real_servers)
            .ok_or(TableError::VirtualServerNotFound(vs.address))
    }
}

/// Parse the output of `ipvsadm -L -n`.
///
/// ```text
/// IP Virtual Server version 1.2.1 (size=4096)
/// Prot LocalAddress:Port Scheduler Flags
///   -> RemoteAddress:Port           Forward Weight ActiveConn InActConn
/// TCP  10.103.97.2:6443 rr
///   -> 192.168.0.2:6443             Masq    1      0          0
/// ```
///
/// Firewall-mark services have no socket address and are skipped together
/// with their real servers.
pub(crate) fn parse_listing(listing: &str) -> Result<Vec<ServiceEntry>, TableError> {
    let mut services: Vec<ServiceEntry> = Vec::new();
    // set while inside a TCP/UDP/SCTP block
    let mut in_service = false;

    for line in listing.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("->") {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.first() == Some(&"RemoteAddress:Port") {
                continue;
            }
            if !in_service {
                continue;
            }
            let service = services
                .last_mut()
                .ok_or_else(|| TableError::Parse(format!("real server outside a service: {}", line)))?;

            if fields.len() < 3 {
                return Err(TableError::Parse(format!("truncated real server line: {}", line)));
            }
            let address = fields[0]
                .parse()
                .map_err(|_| TableError::Parse(format!("invalid real server address '{}'", fields[0])))?;
            let weight = fields[2]
                .parse()
                .map_err(|_| TableError::Parse(format!("invalid weight '{}'", fields[2])))?;
            service.real_servers.push(RealServer::new(address, weight));
            continue;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        match fields.first().copied() {
            Some(protocol @ ("TCP" | "UDP" | "SCTP")) => {
                if fields.len() < 3 {
                    return Err(TableError::Parse(format!("truncated service line: {}", line)));
                }
                let address = fields[1]
                    .parse()
                    .map_err(|_| TableError::Parse(format!("invalid service address '{}'", fields[1])))?;
                services.push(ServiceEntry {
                    protocol: protocol.to_string(),
                    address,
                    scheduler: fields[2].to_string(),
                    real_servers: Vec::new(),
                });
                in_service = true;
            }
            Some("FWM") => in_service = false,
            // banner and column headers
            _ => {}
        }
    }

    Ok(services)
}
