use axum::{Router, http::StatusCode, http::header, response::IntoResponse, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serves the collector's own counters on `/metrics`.
pub struct MetricsServer {
    registry: Arc<Registry>,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl MetricsServer {
    pub fn new(registry: Arc<Registry>, port: u16, cancel: CancellationToken) -> Self {
        Self {
            registry,
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            cancel,
        }
    }

    pub fn router(registry: Arc<Registry>) -> Router {
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move { metrics_handler(registry).await }
            }),
        )
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = Self::router(self.registry.clone());

        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!("Metrics server listening on http://{}/metrics", self.addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await?;

        tracing::info!("Metrics server stopped");
        Ok(())
    }
}

async fn metrics_handler(registry: Arc<Registry>) -> impl IntoResponse {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &registry) {
        tracing::error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
    }

    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorMetrics;

    #[tokio::test]
    async fn serves_registered_metrics() {
        let metrics = CollectorMetrics::default();
        let mut registry = Registry::default();
        metrics.register(&mut registry);
        metrics.ticks.inc();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = MetricsServer::router(Arc::new(registry));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("netdev_collector_ticks_total 1"));
    }
}
