//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, fallback dispatch)
//!     → registry lookup (method + path → entry, params)
//!     → chain task (steps write through the response sink)
//!     → streamed response (head + channel-backed body)
//! ```

pub mod server;

pub use server::GatewayServer;
