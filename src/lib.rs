//! CGI Gateway Library
//!
//! An HTTP server that bridges requests to CGI/1.1 programs: one
//! subprocess per request, routed by regex patterns, processed through a
//! per-route chain of steps.

// Core subsystems
pub mod chain;
pub mod config;
pub mod gateway;
pub mod http;
pub mod routing;
pub mod scope;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use chain::{ChainError, Flow, FnStep, Step, StepCore};
pub use config::GatewayServerConfig;
pub use gateway::{CgiGateway, GatewayConfig, CGI_OPTIONS_KEY};
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
pub use routing::{Registry, RouteEntry, RouteError};
pub use scope::{RequestScope, ResponseSink, SinkError};
