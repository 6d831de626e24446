//! Active health probes.
//!
//! A probe failure is an ordinary verdict, never an error: every failure
//! mode (refused, timeout, TLS, bad status) collapses to
//! [`HealthStatus::Unhealthy`].

use crate::config::{HealthCheckConfig, HealthScheme};
use crate::health::HealthStatus;
use crate::table::RealServer;
use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Errors constructing a probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Checks the health of one real server.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `server`. Must return within `config.timeout`.
    async fn check(&self, server: &RealServer, config: &HealthCheckConfig) -> HealthStatus;
}

/// Probe over the network: TCP connect, or an HTTP(S) GET.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    client: reqwest::Client,
}

impl NetworkProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            // backends such as kube-apiserver serve self-signed certificates
            .danger_accept_invalid_certs(true)
            // fresh connection per probe
            .pool_max_idle_per_host(0)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client })
    }

    /// Perform an HTTP(S) health check.
    async fn http_health_check(
        &self,
        server: SocketAddr,
        config: &HealthCheckConfig,
    ) -> Result<(), String> {
        let url = format!("{}://{}{}", config.scheme, server, config.path);

        let response = self
            .client
            .get(&url)
            .timeout(config.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    "request timeout".to_string()
                } else {
                    format!("request failed: {}", e)
                }
            })?;

        let status = response.status().as_u16();
        if status_matches(status, config.expected_status) {
            Ok(())
        } else {
            Err(format!("unexpected status: {}", status))
        }
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    async fn check(&self, server: &RealServer, config: &HealthCheckConfig) -> HealthStatus {
        let probe = async {
            match config.scheme {
                HealthScheme::Tcp => tcp_health_check(server.address, config.timeout).await,
                HealthScheme::Http | HealthScheme::Https => {
                    self.http_health_check(server.address, config).await
                }
            }
        };

        let result = match timeout(config.timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err("probe timeout".to_string()),
        };

        match result {
            Ok(()) => {
                debug!(server = %server.address, scheme = %config.scheme, "health check passed");
                HealthStatus::Healthy
            }
            Err(reason) => {
                debug!(server = %server.address, scheme = %config.scheme, reason = %reason, "health check failed");
                HealthStatus::Unhealthy
            }
        }
    }
}

/// Perform a TCP health check (just connect).
async fn tcp_health_check(server: SocketAddr, check_timeout: Duration) -> Result<(), String> {
    connect_within(check_timeout, TcpStream::connect(server)).await
}

/// Await a connection attempt for at most `check_timeout`.
async fn connect_within<F, T>(check_timeout: Duration, connect: F) -> Result<(), String>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(check_timeout, connect).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(format!("connection failed: {}", e)),
        Err(_) => Err("connection timeout".to_string()),
    }
}

/// Whether `status` counts as healthy.
fn status_matches(status: u16, expected: Option<u16>) -> bool {
    match expected {
        Some(expected) => status == expected,
        None => (200..300).contains(&status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `response` verbatim to every connection.
    async fn start_raw_http_server(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        addr
    }

    fn http_config(timeout: Duration) -> HealthCheckConfig {
        HealthCheckConfig {
            scheme: HealthScheme::Http,
            path: "/healthz".to_string(),
            timeout,
            expected_status: None,
        }
    }

    #[test]
    fn test_status_matches() {
        assert!(status_matches(200, None));
        assert!(status_matches(204, None));
        assert!(!status_matches(301, None));
        assert!(!status_matches(503, None));
        assert!(status_matches(401, Some(401)));
        assert!(!status_matches(200, Some(204)));
    }

    #[tokio::test]
    async fn test_tcp_health_check_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = tcp_health_check(addr, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_health_check_refused() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let result = tcp_health_check(addr, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let stalled = std::future::pending::<io::Result<()>>();

        let result = connect_within(Duration::from_millis(100), stalled).await;
        assert_eq!(result.unwrap_err(), "connection timeout");
    }

    #[tokio::test]
    async fn test_connect_error_is_not_a_timeout() {
        let failed = async { Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused)) };

        let result = connect_within(Duration::from_secs(1), failed).await;
        assert!(result.unwrap_err().starts_with("connection failed"));
    }

    #[tokio::test]
    async fn test_http_probe_healthy() {
        let addr = start_raw_http_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        )
        .await;
        let probe = NetworkProbe::new().unwrap();

        let status = probe
            .check(&RealServer::new(addr, 1), &http_config(Duration::from_secs(2)))
            .await;
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_http_probe_bad_status() {
        let addr = start_raw_http_server(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let probe = NetworkProbe::new().unwrap();

        let status = probe
            .check(&RealServer::new(addr, 1), &http_config(Duration::from_secs(2)))
            .await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_http_probe_expected_status() {
        let addr = start_raw_http_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let probe = NetworkProbe::new().unwrap();
        let mut config = http_config(Duration::from_secs(2));
        config.expected_status = Some(204);

        let status = probe.check(&RealServer::new(addr, 1), &config).await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_http_probe_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept and hold connections without answering
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let probe = NetworkProbe::new().unwrap();
        let started = std::time::Instant::now();
        let status = probe
            .check(&RealServer::new(addr, 1), &http_config(Duration::from_millis(200)))
            .await;

        assert_eq!(status, HealthStatus::Unhealthy);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_https_probe_against_plain_server() {
        let addr = start_raw_http_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let probe = NetworkProbe::new().unwrap();
        let mut config = http_config(Duration::from_secs(2));
        config.scheme = HealthScheme::Https;

        let status = probe.check(&RealServer::new(addr, 1), &config).await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }
}
