//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! gateway. All types derive Serde traits for deserialization from config
//! files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the CGI gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayServerConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Route definitions mapping request lines to CGI programs.
    pub routes: Vec<RouteConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// One routed CGI program.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouteConfig {
    /// HTTP method (GET, POST, PUT, DELETE).
    pub method: String,

    /// Path pattern; capture groups become positional arguments.
    pub pattern: String,

    /// Path of the CGI binary to execute.
    pub bin: String,

    /// Fixed arguments passed ahead of dynamic options and route params.
    pub args: Vec<String>,

    /// Fixed environment entries, overriding the CGI-standard set on
    /// name collision.
    pub env: BTreeMap<String, String>,

    /// Per-route timeout in milliseconds; 0 inherits the global default.
    pub timeout_ms: u64,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default per-route timeout in milliseconds; 0 means unbounded.
    pub route_ms: u64,
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Expose a Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Bind address of the scrape endpoint.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9100".to_string(),
        }
    }
}
