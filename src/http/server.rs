//! HTTP server implementation.

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, RateLimitState};
use crate::error::{Result, TurnstileError};

/// Build the service router.
///
/// Every route except `/health` sits behind the rate limiter.
pub fn router(state: RateLimitState) -> Router {
    Router::new()
        .route("/", get(index))
        .route_layer(axum::middleware::from_fn_with_state(state, rate_limit))
        .route("/health", get(health))
}

async fn index() -> &'static str {
    "Request admitted\n"
}

async fn health() -> &'static str {
    "OK\n"
}

/// HTTP server for the rate limited service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Middleware state shared by all requests
    state: RateLimitState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: RateLimitState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TurnstileError::Io(e)
        })?;

        info!(
            addr = %self.addr,
            "Starting HTTP server with graceful shutdown"
        );

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TurnstileError::Io(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ClientIpResolver;
    use crate::http::StoreErrorPolicy;
    use crate::ratelimit::{LimiterOptions, RateLimiter};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state(max_requests: u64) -> RateLimitState {
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            LimiterOptions::new(60_000, max_requests),
        )
        .unwrap();
        RateLimitState::new(
            Arc::new(limiter),
            Arc::new(ClientIpResolver::default()),
            StoreErrorPolicy::Open,
        )
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let _server = HttpServer::new(addr, state(10));
    }

    #[tokio::test]
    async fn test_index_is_rate_limited() {
        let app = router(state(1));

        let first = app.clone().oneshot(get_request("/")).await.unwrap();
        let second = app.oneshot(get_request("/")).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_health_is_not_rate_limited() {
        let app = router(state(1));

        for _ in 0..3 {
            let response = app.clone().oneshot(get_request("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, state(10));

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
