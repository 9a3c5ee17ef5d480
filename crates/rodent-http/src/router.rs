//! Router composition
//!
//! Each crate exposes a `create_router(state)` function; the service nests
//! them here under their prefixes to form the unified router.

use axum::Router;
use tracing::info;

/// Builder for composing per-crate routers
pub struct RouterBuilder {
    router: Router,
    services: Vec<(&'static str, &'static str)>, // (prefix, name)
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            services: Vec::new(),
        }
    }

    /// Mount a router at a prefix
    pub fn nest(mut self, prefix: &'static str, name: &'static str, router: Router) -> Self {
        info!("Mounting service '{}' at {}", name, prefix);
        self.router = self.router.nest(prefix, router);
        self.services.push((prefix, name));
        self
    }

    /// Add a route directly to the root router
    pub fn route(mut self, path: &str, method_router: axum::routing::MethodRouter) -> Self {
        self.router = self.router.route(path, method_router);
        self
    }

    /// Mounted services, for diagnostics
    pub fn services(&self) -> &[(&'static str, &'static str)] {
        &self.services
    }

    /// Build the final router
    pub fn build(self) -> Router {
        self.router
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience function to create a router builder
pub fn router() -> RouterBuilder {
    RouterBuilder::new()
}
