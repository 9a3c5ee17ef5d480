//! Shared middleware stack
//!
//! Applied once to the composed router so every surface behaves the same.

use axum::{body::Body, http::Request, middleware, middleware::Next, response::Response, Router};
use std::time::{Duration, Instant};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

/// Middleware configuration
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    /// Enable CORS (default: true)
    pub cors_enabled: bool,
    /// Enable request tracing (default: true)
    pub tracing_enabled: bool,
    /// Per-request timeout (default: 90s, above the run deadline)
    pub timeout: Duration,
    /// Enable request logging (default: true)
    pub request_logging: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            cors_enabled: true,
            tracing_enabled: true,
            timeout: Duration::from_secs(90),
            request_logging: true,
        }
    }
}

impl MiddlewareConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cors(mut self, enabled: bool) -> Self {
        self.cors_enabled = enabled;
        self
    }

    pub fn tracing(mut self, enabled: bool) -> Self {
        self.tracing_enabled = enabled;
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    pub fn request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }
}

/// Apply the middleware stack to a router.
pub fn apply_middleware(router: Router, config: MiddlewareConfig) -> Router {
    let mut router = router;

    if config.request_logging {
        router = router.layer(middleware::from_fn(request_logging_middleware));
    }

    router = router.layer(TimeoutLayer::new(config.timeout));

    if config.tracing_enabled {
        router = router.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );
    }

    if config.cors_enabled {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router
}

/// Log each request with a level matching its status class.
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();
    if status.is_server_error() {
        tracing::error!("{} {} {} - {}ms", method, uri, status.as_u16(), duration.as_millis());
    } else if status.is_client_error() {
        tracing::warn!("{} {} {} - {}ms", method, uri, status.as_u16(), duration.as_millis());
    } else {
        tracing::info!("{} {} {} - {}ms", method, uri, status.as_u16(), duration.as_millis());
    }

    response
}
