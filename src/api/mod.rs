use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::health::Health;

pub mod error;

pub use error::{ApiError, ApiResult};

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// The operational HTTP surface: health and readiness. The product API
/// (sends, domains, contacts) mounts on top of this router in the full
/// deployment.
pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(
        socket: SocketAddr,
        health: Health,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> ApiServer {
        let router = Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .layer((
                TraceLayer::new_for_http(),
                TimeoutLayer::new(request_timeout),
            ))
            .with_state(health);

        ApiServer {
            router,
            socket,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket)
            .await
            .map_err(ApiServerError::Bind)?;

        info!("http server listening on {}", self.socket);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
            .await
            .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(e) = self.serve().await {
                error!("http server error: {e:?}");
                token.cancel();
            }
        });
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}

async fn healthz(State(health): State<Health>) -> impl IntoResponse {
    let report = health.check().await;
    let status = if report.degraded() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

/// Like `/healthz`, but refuses outright while the process is draining.
async fn readyz(State(health): State<Health>) -> axum::response::Response {
    if !health.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "draining" })),
        )
            .into_response();
    }

    healthz(State(health)).await.into_response()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::health::Health;

    #[tokio::test]
    async fn readiness_follows_the_drain_flag() {
        let health = Health::new(vec![]);
        health.set_ready(false);

        let response = readyz(State(health.clone())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        health.set_ready(true);
        let response = readyz(State(health)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_dependency_set_is_healthy() {
        let response = healthz(State(Health::new(vec![]))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
