//! CGI environment and argument assembly.
//!
//! Builds the environment block and argument vector a CGI program receives,
//! as pure functions over the gateway configuration and the request scope.
//!
//! # Design Decisions
//! - Assembly order is the standard CGI variables, then header-derived
//!   pairs, then fixed configuration entries; the process environment
//!   applies them in order, so on a name collision the later pair wins
//!   and a fixed entry overrides everything
//! - Header names are doubled: the raw name and an `HTTP_`-prefixed copy,
//!   both uppercased with hyphens turned into underscores

use axum::http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};

use crate::scope::RequestScope;

use super::GatewayConfig;

/// Scope-data key whose `Vec<String>` value is appended to the argument
/// vector ahead of route parameters. Other value types are ignored.
pub const CGI_OPTIONS_KEY: &str = "cgi:options";

const SERVER_PROTOCOL: &str = "HTTP/1.1";
const GATEWAY_INTERFACE: &str = "CGI/1.1";

/// Assemble the complete environment for one invocation, in application
/// order.
pub fn build_env(config: &GatewayConfig, scope: &RequestScope) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> =
        Vec::with_capacity(config.env.len() + 8 + scope.headers().len() * 2);

    let (server_name, server_port) = split_host(scope.host());
    env.push(("SERVER_PROTOCOL".into(), SERVER_PROTOCOL.into()));
    env.push(("GATEWAY_INTERFACE".into(), GATEWAY_INTERFACE.into()));
    env.push(("PATH_INFO".into(), scope.path().into()));
    env.push(("REQUEST_METHOD".into(), scope.method().as_str().into()));
    env.push(("QUERY_STRING".into(), scope.query().into()));
    env.push(("CONTENT_LENGTH".into(), content_length(scope).to_string()));
    env.push(("SERVER_NAME".into(), server_name.into()));
    env.push(("SERVER_PORT".into(), server_port.into()));

    for (name, value) in scope.headers() {
        let doubled = cgi_name(name.as_str());
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        env.push((doubled.clone(), value.clone()));
        env.push((format!("HTTP_{doubled}"), value));
    }

    for (name, value) in &config.env {
        env.push((name.clone(), value.clone()));
    }

    env
}

/// Assemble the argument vector: fixed arguments, then dynamic options from
/// the scope, then captured route parameters.
pub fn build_args(config: &GatewayConfig, scope: &RequestScope) -> Vec<String> {
    let mut args = config.args.clone();
    if let Some(options) = scope.get_as::<Vec<String>>(CGI_OPTIONS_KEY) {
        args.extend(options.iter().cloned());
    }
    args.extend(scope.params().iter().cloned());
    args
}

/// Declared request body length: the `Content-Length` value when parseable,
/// `-1` under chunked transfer encoding, `0` otherwise.
fn content_length(scope: &RequestScope) -> i64 {
    if let Some(len) = scope
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        return len;
    }
    let chunked = scope
        .headers()
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        -1
    } else {
        0
    }
}

/// `host[:port]` split into name and port; the port defaults to `80`
/// when the host carries none.
fn split_host(host: &str) -> (&str, &str) {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (name, port)
        }
        _ => (host, "80"),
    }
}

/// `content-type` -> `CONTENT_TYPE`.
fn cgi_name(header: &str) -> String {
    header.to_ascii_uppercase().replace('-', "_")
}
