//! Prometheus exposition endpoint.

use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const OPENMETRICS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// HTTP server for `/metrics` (path configurable) plus a liveness route.
pub struct MetricsServer {
    listener: TcpListener,
    routes: Arc<Routes>,
}

struct Routes {
    metrics_path: String,
    collector: MetricsCollector,
}

impl MetricsServer {
    /// Bind the listening socket. Binding early lets callers fail startup
    /// on an address in use instead of losing metrics silently.
    pub async fn bind(
        address: SocketAddr,
        path: String,
        collector: MetricsCollector,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            routes: Arc::new(Routes {
                metrics_path: path,
                collector,
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(address) = self.listener.local_addr() {
            info!(address = %address, path = %self.routes.metrics_path, "metrics server started");
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                            continue;
                        }
                    };

                    let routes = Arc::clone(&self.routes);
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                            let routes = Arc::clone(&routes);
                            async move { Ok::<_, Infallible>(routes.respond(&req)) }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(error = %e, "metrics connection error");
                        }
                    });
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

impl Routes {
    fn respond<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        let path = req.uri().path();
        debug!(path = %path, method = %req.method(), "metrics request");

        if req.method() != Method::GET {
            return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n");
        }

        match path {
            p if p == self.metrics_path => self.scrape(),
            "/healthz" | "/health" => text(StatusCode::OK, "OK\n"),
            "/" => text(
                StatusCode::OK,
                format!(
                    "lvscare metrics server\n\nEndpoints:\n  {} - Prometheus metrics\n  /healthz - Liveness\n",
                    self.metrics_path
                ),
            ),
            _ => text(StatusCode::NOT_FOUND, "Not found\n"),
        }
    }

    fn scrape(&self) -> Response<Full<Bytes>> {
        let mut body = String::new();
        if let Err(e) = encode(&mut body, self.collector.registry()) {
            error!(error = %e, "failed to encode metrics");
            return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics\n");
        }

        let mut response = text(StatusCode::OK, body);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(OPENMETRICS_TEXT));
        response
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}
