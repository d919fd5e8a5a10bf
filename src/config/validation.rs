//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check route patterns compile and methods are routable
//! - Detect duplicate method/pattern pairs before they hit the registry
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function over the parsed config
//! - Runs before the config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::GatewayServerConfig;

const ROUTABLE_METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

/// One semantic problem found in a config.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("route {index}: empty bin")]
    EmptyBin { index: usize },
    #[error("route {index}: method {method:?} is not routable")]
    BadMethod { index: usize, method: String },
    #[error("route {index}: pattern {pattern:?} does not compile: {source}")]
    BadPattern {
        index: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("route {index}: duplicate of {method} {pattern:?}")]
    DuplicateRoute {
        index: usize,
        method: String,
        pattern: String,
    },
    #[error("listener bind_address is empty")]
    EmptyBindAddress,
}

/// Validate a parsed config, collecting every problem found.
pub fn validate_config(config: &GatewayServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.trim().is_empty() {
        errors.push(ValidationError::EmptyBindAddress);
    }

    let mut seen: HashSet<(String, String)> = HashSet::new();
    for (index, route) in config.routes.iter().enumerate() {
        let method = route.method.to_ascii_uppercase();
        if !ROUTABLE_METHODS.contains(&method.as_str()) {
            errors.push(ValidationError::BadMethod {
                index,
                method: route.method.clone(),
            });
        }
        if route.bin.trim().is_empty() {
            errors.push(ValidationError::EmptyBin { index });
        }
        if let Err(source) = regex::Regex::new(&route.pattern) {
            errors.push(ValidationError::BadPattern {
                index,
                pattern: route.pattern.clone(),
                source,
            });
        }
        if !seen.insert((method.clone(), route.pattern.clone())) {
            errors.push(ValidationError::DuplicateRoute {
                index,
                method,
                pattern: route.pattern.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
