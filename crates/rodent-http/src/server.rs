//! Central HTTP server
//!
//! One server carries every rodent HTTP surface. Plain HTTP: the daemon
//! lives on an appliance LAN behind the host firewall.

use crate::middleware::{apply_middleware, MiddlewareConfig};
use crate::{Result, ServerError};
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind host
    pub bind_host: String,
    /// HTTP port
    pub http_port: u16,
    /// Public hostname for logging/display
    pub public_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            http_port: 8400,
            public_host: gethostname::gethostname().to_string_lossy().to_string(),
        }
    }
}

/// Central HTTP server
pub struct HttpServer {
    config: ServerConfig,
    router: Router,
}

impl HttpServer {
    /// Create a new server builder
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder::new()
    }

    /// Get server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind and serve until the task is cancelled
    pub async fn serve(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_host, self.config.http_port)
            .parse()
            .map_err(|_| {
                ServerError::BindError(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "Invalid HTTP bind address",
                ))
            })?;

        let listener = TcpListener::bind(addr).await.map_err(ServerError::BindError)?;

        info!("HTTP server listening on http://{}", addr);
        info!(
            "Public URL: http://{}:{}",
            self.config.public_host, self.config.http_port
        );

        axum::serve(listener, self.router)
            .await
            .map_err(|e| ServerError::BindError(std::io::Error::other(e)))?;

        Ok(())
    }
}

/// Builder for HttpServer
pub struct HttpServerBuilder {
    bind_host: String,
    http_port: u16,
    public_host: Option<String>,
    router: Option<Router>,
    middleware_config: MiddlewareConfig,
}

impl HttpServerBuilder {
    pub fn new() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            http_port: 8400,
            public_host: None,
            router: None,
            middleware_config: MiddlewareConfig::default(),
        }
    }

    /// Set bind address (host:port format or just a port)
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        if let Some((host, port)) = addr.split_once(':') {
            self.bind_host = host.to_string();
            if let Ok(p) = port.parse() {
                self.http_port = p;
            }
        } else if let Ok(p) = addr.parse::<u16>() {
            self.http_port = p;
        }
        self
    }

    /// Set public hostname
    pub fn public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    /// Set the router
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Set middleware configuration
    pub fn middleware(mut self, config: MiddlewareConfig) -> Self {
        self.middleware_config = config;
        self
    }

    /// Enable/disable CORS
    pub fn cors(mut self, enabled: bool) -> Self {
        self.middleware_config.cors_enabled = enabled;
        self
    }

    /// Build the server
    pub fn build(self) -> Result<HttpServer> {
        let router = self.router.unwrap_or_default();
        let router = apply_middleware(router, self.middleware_config);

        let public_host = self
            .public_host
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string());

        Ok(HttpServer {
            config: ServerConfig {
                bind_host: self.bind_host,
                http_port: self.http_port,
                public_host,
            },
            router,
        })
    }
}

impl Default for HttpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
