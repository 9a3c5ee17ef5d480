//! rodent-http: Central HTTP Server
//!
//! The single place HTTP is handled for rodent. Other crates export routers
//! that get composed here.
//!
//! Architecture:
//! ```text
//! rodent-service binary
//!     └── rodent-http (this crate)
//!         ├── Middleware stack (CORS, tracing, timeout, request log)
//!         └── Router composition
//!             └── /autosnapshot/* → rodent_autosnap::http::create_router()
//! ```

pub mod middleware;
pub mod router;
pub mod server;

// Re-export main types
pub use middleware::{apply_middleware, MiddlewareConfig};
pub use router::RouterBuilder;
pub use server::{HttpServer, HttpServerBuilder, ServerConfig};

// Re-export axum for convenience - other crates use this
pub use axum;
pub use tower;
pub use tower_http;

/// Error types for the HTTP server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server binding error: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Router configuration error: {0}")]
    RouterError(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Prelude for convenient imports by other crates
pub mod prelude {
    pub use super::middleware::MiddlewareConfig;
    pub use super::router::RouterBuilder;
    pub use super::server::{HttpServer, HttpServerBuilder, ServerConfig};
    pub use super::Result;
}
