//! Metrics exposition server.
//!
//! # Responsibilities
//! - Serve `GET /metrics` with the Prometheus text format
//! - Tag each scrape with a request id
//! - Stop on run cancellation or explicit `stop`
//!
//! # Design Decisions
//! - Started once per run; a second start is an error, not a restart
//! - Scrapes slower than a second are logged (exposition should stay cheap)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::ids::IdGenerator;
use crate::lifecycle::cancellation::CancellationToken;
use crate::observability::metrics::{Metrics, MetricsError};

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const SLOW_SCRAPE: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct ExpositionState {
    metrics: Metrics,
    ids: IdGenerator,
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

/// HTTP listener exposing a run's metrics.
pub struct MetricsServer {
    router: Router,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl MetricsServer {
    pub fn new(metrics: Metrics, ids: IdGenerator) -> Self {
        let router = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(ExpositionState { metrics, ids });
        Self {
            router,
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Bind `address` and serve until `stop_on` is cancelled or
    /// [`stop`](Self::stop) is called. Returns the bound address.
    pub async fn start(
        &self,
        address: &str,
        stop_on: CancellationToken,
    ) -> Result<SocketAddr, MetricsError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(MetricsError::AlreadyRunning);
        }

        let listener = match TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(source) => {
                self.started.store(false, Ordering::Release);
                return Err(MetricsError::Bind {
                    address: address.to_string(),
                    source,
                });
            }
        };
        let addr = listener.local_addr().map_err(|source| MetricsError::Bind {
            address: address.to_string(),
            source,
        })?;

        let shutdown = CancellationToken::new();
        let own = shutdown.clone();
        let app = self.router.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    tokio::select! {
                        _ = stop_on.cancelled() => {}
                        _ = own.cancelled() => {}
                    }
                })
                .await
        });

        tracing::info!(address = %addr, "Metrics server listening");

        if let Ok(mut running) = self.running.lock() {
            *running = Some(Running {
                addr,
                shutdown,
                task,
            });
        }
        Ok(addr)
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.as_ref().map(|r| r.addr))
    }

    /// Stop accepting scrapes and wait (bounded) for the listener to close.
    pub async fn stop(&self) {
        let running = self.running.lock().ok().and_then(|mut running| running.take());
        let Some(running) = running else {
            return;
        };

        running.shutdown.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, running.task).await {
            Ok(Ok(Ok(()))) => tracing::debug!("Metrics server stopped"),
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Metrics server failed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Metrics server task aborted"),
            Err(_) => tracing::warn!("Metrics server did not stop in time"),
        }
    }
}

async fn metrics_handler(State(state): State<ExpositionState>) -> impl IntoResponse {
    let request_id = state.ids.generate();
    let start = Instant::now();
    let body = state.metrics.render();
    let elapsed = start.elapsed();

    if elapsed > SLOW_SCRAPE {
        tracing::warn!(request_id = %request_id, elapsed = ?elapsed, "Slow metrics exposition");
    } else {
        tracing::debug!(request_id = %request_id, elapsed = ?elapsed, "Metrics scraped");
    }

    let request_id = HeaderValue::from_str(&request_id)
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE)),
            (HeaderName::from_static("x-request-id"), request_id),
        ],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::{MetricDescriptor, MetricsRegistry};
    use std::sync::Arc;

    fn server() -> (MetricsServer, Metrics) {
        let metrics = Metrics::new(Arc::new(MetricsRegistry::new(&[1.0]).unwrap()));
        (MetricsServer::new(metrics.clone(), IdGenerator::new()), metrics)
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let (server, _) = server();
        let token = CancellationToken::new();
        let addr = server.start("127.0.0.1:0", token.clone()).await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        let err = server.start("127.0.0.1:0", token.clone()).await.unwrap_err();
        assert!(matches!(err, MetricsError::AlreadyRunning));

        server.stop().await;
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn test_serves_metrics() {
        let (server, metrics) = server();
        metrics
            .counter(&MetricDescriptor::new("scrape_test_total", "test"))
            .increment(1);

        let token = CancellationToken::new();
        let addr = server.start("127.0.0.1:0", token.clone()).await.unwrap();

        let res = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
        assert_eq!(res.status(), 200);
        assert!(res.headers().contains_key("x-request-id"));
        let body = res.text().await.unwrap();
        assert!(body.contains("scrape_test_total 1"));

        token.cancel();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let (server, _) = server();
        let err = server
            .start("256.0.0.1:0", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::Bind { .. }));
    }
}
