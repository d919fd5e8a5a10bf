//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! config / builder calls
//!     → RouteEntry (compiled pattern + step chain + shared data)
//!     → Registry.register (per-method tables, registration order)
//!
//! Incoming Request (method, path)
//!     → Registry.find
//!     → Return: (matched entry, captured params) or NoMatch
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - Deterministic: first registered match wins
//! - Registering the same pattern twice for a method is a build error

pub mod entry;
pub mod registry;

pub use entry::RouteEntry;
pub use registry::{Registry, RouteError};
