//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure for one care session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CareConfig {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// The virtual server to keep alive
    pub virtual_server: VirtualServerConfig,

    /// Backends that may be registered under the virtual server
    #[serde(default)]
    pub real_servers: Vec<ServerConfig>,

    /// Health check applied to every real server
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Time between reconciliation cycles
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Reconcile once and exit
    #[serde(default)]
    pub run_once: bool,

    /// Delete the virtual server before creating it
    #[serde(default)]
    pub clean: bool,

    /// Kernel table access settings
    #[serde(default)]
    pub ipvs: IpvsConfig,
}

impl CareConfig {
    /// Create a configuration for `address` with every other field defaulted.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            global: GlobalConfig::default(),
            virtual_server: VirtualServerConfig {
                address,
                scheduler: Scheduler::default(),
            },
            real_servers: Vec::new(),
            health_check: HealthCheckConfig::default(),
            interval: default_interval(),
            run_once: false,
            clean: false,
            ipvs: IpvsConfig::default(),
        }
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{}' (expected json or pretty)", other)),
        }
    }
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Virtual server definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VirtualServerConfig {
    /// Virtual address and port
    pub address: SocketAddr,

    /// IPVS scheduling algorithm
    #[serde(default)]
    pub scheduler: Scheduler,
}

/// IPVS scheduler, named the way ipvsadm names it.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    #[default]
    Rr,
    Wrr,
    Lc,
    Wlc,
    Sh,
    Dh,
}

impl Scheduler {
    /// Name passed to `ipvsadm -s`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheduler::Rr => "rr",
            Scheduler::Wrr => "wrr",
            Scheduler::Lc => "lc",
            Scheduler::Wlc => "wlc",
            Scheduler::Sh => "sh",
            Scheduler::Dh => "dh",
        }
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheduler {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rr" => Ok(Scheduler::Rr),
            "wrr" => Ok(Scheduler::Wrr),
            "lc" => Ok(Scheduler::Lc),
            "wlc" => Ok(Scheduler::Wlc),
            "sh" => Ok(Scheduler::Sh),
            "dh" => Ok(Scheduler::Dh),
            other => Err(format!("unknown scheduler '{}'", other)),
        }
    }
}

/// Individual real server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Server address and port
    pub address: SocketAddr,

    /// IPVS weight (default: 1)
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl FromStr for ServerConfig {
    type Err = String;

    /// Parses `ADDR:PORT` or `ADDR:PORT@WEIGHT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, weight) = match s.rsplit_once('@') {
            Some((addr, weight)) => {
                let weight = weight
                    .parse()
                    .map_err(|_| format!("invalid weight in '{}'", s))?;
                (addr, weight)
            }
            None => (s, default_weight()),
        };

        let address = addr
            .parse()
            .map_err(|_| format!("invalid real server address '{}'", addr))?;

        Ok(Self { address, weight })
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// How to probe: tcp, http or https
    #[serde(default)]
    pub scheme: HealthScheme,

    /// HTTP path to request (ignored for tcp)
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Upper bound for a single probe
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Exact status required; any 2xx when unset
    #[serde(default)]
    pub expected_status: Option<u16>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            scheme: HealthScheme::default(),
            path: default_health_path(),
            timeout: default_health_timeout(),
            expected_status: None,
        }
    }
}

/// Health check scheme.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthScheme {
    Tcp,
    Http,
    #[default]
    Https,
}

impl HealthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthScheme::Tcp => "tcp",
            HealthScheme::Http => "http",
            HealthScheme::Https => "https",
        }
    }
}

impl fmt::Display for HealthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(HealthScheme::Tcp),
            "http" => Ok(HealthScheme::Http),
            "https" => Ok(HealthScheme::Https),
            other => Err(format!("unknown health scheme '{}'", other)),
        }
    }
}

/// Kernel table access settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpvsConfig {
    /// Path of the ipvsadm binary
    #[serde(default = "default_ipvsadm_path")]
    pub ipvsadm_path: PathBuf,

    /// Packet forwarding method for real servers
    #[serde(default)]
    pub forward_method: ForwardMethod,
}

impl Default for IpvsConfig {
    fn default() -> Self {
        Self {
            ipvsadm_path: default_ipvsadm_path(),
            forward_method: ForwardMethod::default(),
        }
    }
}

/// IPVS packet forwarding method.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMethod {
    #[default]
    Masquerade,
    Route,
    Tunnel,
}

impl ForwardMethod {
    /// Flag passed to `ipvsadm -a`.
    pub fn ipvsadm_flag(&self) -> &'static str {
        match self {
            ForwardMethod::Masquerade => "-m",
            ForwardMethod::Route => "-g",
            ForwardMethod::Tunnel => "-i",
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9095))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_ipvsadm_path() -> PathBuf {
    PathBuf::from("ipvsadm")
}

fn default_weight() -> u32 {
    1
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
