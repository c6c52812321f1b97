//! HTTP exposition of the metrics registry, plus liveness and readiness

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::Metrics;

/// Serves `/metrics`, `/health` and `/ready`
///
/// `/ready` answers 503 until the message service reports it has started.
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr, ready: Arc<AtomicBool>) -> Self {
        Self {
            metrics,
            addr,
            ready,
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics exporter listening on http://{}/metrics", self.addr);

        loop {
            let (stream, remote) = listener.accept().await?;
            debug!("Metrics scrape connection from {}", remote);
            let metrics = self.metrics.clone();
            let ready = self.ready.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let response = respond(req.uri().path(), &metrics, &ready);
                    async move { Ok::<_, Infallible>(response) }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    error!("Metrics connection from {} failed: {:?}", remote, e);
                }
            });
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .unwrap()
}

fn respond(path: &str, metrics: &Metrics, ready: &AtomicBool) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            match encoder.encode(&metrics.registry.gather(), &mut buffer) {
                Ok(()) => Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", encoder.format_type())
                    .body(Full::new(Bytes::from(buffer)))
                    .unwrap(),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed")
                }
            }
        }
        "/health" | "/healthz" => text(StatusCode::OK, "OK"),
        "/ready" | "/readyz" if ready.load(Ordering::Acquire) => text(StatusCode::OK, "OK"),
        "/ready" | "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "starting"),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}
