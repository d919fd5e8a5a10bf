//! Per-method route tables with registration-order matching.

use axum::http::Method;
use thiserror::Error;

use std::sync::Arc;

use crate::chain::{ChainError, Step};
use crate::config::{GatewayServerConfig, RouteConfig};
use crate::gateway::{CgiGateway, GatewayConfig};

use super::RouteEntry;

/// Errors raised while building the route tables.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate route {method} {pattern:?}")]
    DuplicatePattern { method: Method, pattern: String },
    #[error("unsupported route method {0:?}")]
    UnsupportedMethod(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// All registered routes, grouped by method.
///
/// Lookup walks a method's entries in registration order and returns the
/// first match. The registry is mutated only during startup; dispatch sees
/// it behind an `Arc` and never writes.
#[derive(Default)]
pub struct Registry {
    get: Vec<Arc<RouteEntry>>,
    post: Vec<Arc<RouteEntry>>,
    put: Vec<Arc<RouteEntry>>,
    delete: Vec<Arc<RouteEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration: one CGI route per entry.
    pub fn from_config(config: &GatewayServerConfig) -> Result<Self, RouteError> {
        let mut registry = Self::new();
        for route in &config.routes {
            registry.register_cgi_route(route, config.timeouts.route_ms)?;
        }
        Ok(registry)
    }

    fn register_cgi_route(
        &mut self,
        route: &RouteConfig,
        default_timeout_ms: u64,
    ) -> Result<(), RouteError> {
        let method = parse_method(&route.method)?;
        let gateway = CgiGateway::new(GatewayConfig {
            bin: route.bin.clone(),
            args: route.args.clone(),
            env: route.env.clone(),
        });
        let mut entry = new_entry(&route.pattern)?;
        entry.use_steps(vec![Box::new(gateway)])?;
        let timeout_ms = if route.timeout_ms > 0 {
            route.timeout_ms
        } else {
            default_timeout_ms
        };
        if timeout_ms > 0 {
            entry.set_timeout_ms(timeout_ms);
        }
        self.register(method, entry)
    }

    /// Register a fully configured entry. Rejects a pattern already present
    /// for the method.
    pub fn register(&mut self, method: Method, entry: RouteEntry) -> Result<(), RouteError> {
        let table = self.table_mut(&method)?;
        if table.iter().any(|e| e.pattern() == entry.pattern()) {
            return Err(RouteError::DuplicatePattern {
                method,
                pattern: entry.pattern().to_string(),
            });
        }
        table.push(Arc::new(entry));
        Ok(())
    }

    /// Register a route running the given steps.
    pub fn on(
        &mut self,
        method: Method,
        pattern: &str,
        steps: Vec<Box<dyn Step>>,
    ) -> Result<(), RouteError> {
        let mut entry = new_entry(pattern)?;
        entry.use_steps(steps)?;
        self.register(method, entry)
    }

    pub fn on_get(&mut self, pattern: &str, steps: Vec<Box<dyn Step>>) -> Result<(), RouteError> {
        self.on(Method::GET, pattern, steps)
    }

    pub fn on_post(&mut self, pattern: &str, steps: Vec<Box<dyn Step>>) -> Result<(), RouteError> {
        self.on(Method::POST, pattern, steps)
    }

    pub fn on_put(&mut self, pattern: &str, steps: Vec<Box<dyn Step>>) -> Result<(), RouteError> {
        self.on(Method::PUT, pattern, steps)
    }

    pub fn on_delete(&mut self, pattern: &str, steps: Vec<Box<dyn Step>>) -> Result<(), RouteError> {
        self.on(Method::DELETE, pattern, steps)
    }

    /// Register a CGI route for `method`.
    pub fn cgi(
        &mut self,
        method: Method,
        pattern: &str,
        config: GatewayConfig,
    ) -> Result<(), RouteError> {
        self.on(method, pattern, vec![Box::new(CgiGateway::new(config))])
    }

    pub fn cgi_get(&mut self, pattern: &str, config: GatewayConfig) -> Result<(), RouteError> {
        self.cgi(Method::GET, pattern, config)
    }

    pub fn cgi_post(&mut self, pattern: &str, config: GatewayConfig) -> Result<(), RouteError> {
        self.cgi(Method::POST, pattern, config)
    }

    pub fn cgi_put(&mut self, pattern: &str, config: GatewayConfig) -> Result<(), RouteError> {
        self.cgi(Method::PUT, pattern, config)
    }

    pub fn cgi_delete(&mut self, pattern: &str, config: GatewayConfig) -> Result<(), RouteError> {
        self.cgi(Method::DELETE, pattern, config)
    }

    /// First matching entry for the request line, with captured params.
    pub fn find(&self, method: &Method, path: &str) -> Option<(Arc<RouteEntry>, Vec<String>)> {
        let table = self.table(method)?;
        for entry in table {
            if let Some(params) = entry.matches(path) {
                return Some((Arc::clone(entry), params));
            }
        }
        None
    }

    fn table(&self, method: &Method) -> Option<&Vec<Arc<RouteEntry>>> {
        if *method == Method::GET {
            Some(&self.get)
        } else if *method == Method::POST {
            Some(&self.post)
        } else if *method == Method::PUT {
            Some(&self.put)
        } else if *method == Method::DELETE {
            Some(&self.delete)
        } else {
            None
        }
    }

    fn table_mut(&mut self, method: &Method) -> Result<&mut Vec<Arc<RouteEntry>>, RouteError> {
        if *method == Method::GET {
            Ok(&mut self.get)
        } else if *method == Method::POST {
            Ok(&mut self.post)
        } else if *method == Method::PUT {
            Ok(&mut self.put)
        } else if *method == Method::DELETE {
            Ok(&mut self.delete)
        } else {
            Err(RouteError::UnsupportedMethod(method.to_string()))
        }
    }
}

fn new_entry(pattern: &str) -> Result<RouteEntry, RouteError> {
    RouteEntry::new(pattern).map_err(|source| RouteError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn parse_method(method: &str) -> Result<Method, RouteError> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        other => Err(RouteError::UnsupportedMethod(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Flow, FnStep};

    fn step() -> Vec<Box<dyn Step>> {
        vec![Box::new(FnStep::new(|_| Box::pin(async { Flow::Continue })))]
    }

    #[test]
    fn registration_order_decides_precedence() {
        let mut registry = Registry::new();
        registry.on_get(r"^/api/(\w+)$", step()).unwrap();
        registry.on_get(r"^/api/status$", step()).unwrap();

        let (entry, params) = registry.find(&Method::GET, "/api/status").unwrap();
        assert_eq!(entry.pattern(), r"^/api/(\w+)$");
        assert_eq!(params, vec!["status".to_string()]);
    }

    #[test]
    fn duplicate_pattern_per_method_is_rejected() {
        let mut registry = Registry::new();
        registry.on_get("^/a$", step()).unwrap();
        let err = registry.on_get("^/a$", step()).unwrap_err();
        assert!(matches!(err, RouteError::DuplicatePattern { .. }));
        // The same pattern under another method is fine.
        registry.on_post("^/a$", step()).unwrap();
    }

    #[test]
    fn methods_are_isolated() {
        let mut registry = Registry::new();
        registry.on_post("^/submit$", step()).unwrap();
        assert!(registry.find(&Method::GET, "/submit").is_none());
        assert!(registry.find(&Method::POST, "/submit").is_some());
        assert!(registry.find(&Method::PATCH, "/submit").is_none());
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let mut registry = Registry::new();
        let err = registry
            .on(Method::PATCH, "^/x$", step())
            .unwrap_err();
        assert!(matches!(err, RouteError::UnsupportedMethod(_)));
    }
}
