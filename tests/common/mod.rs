//! Shared helpers for the gateway integration tests.

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tempfile::TempDir;
use tokio::net::TcpListener;

use cgi_gateway::http::GatewayServer;
use cgi_gateway::lifecycle::Shutdown;
use cgi_gateway::routing::Registry;

/// Write an executable shell script into `dir` and return its path.
pub fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(&path, script).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// Start a gateway on an ephemeral port; returns its address and the
/// shutdown handle keeping it alive.
pub async fn start_gateway(registry: Registry) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    let server = GatewayServer::new(registry);
    tokio::spawn(async move {
        let _ = server.run(listener, receiver).await;
    });
    (addr, shutdown)
}

/// Non-pooled client so each test request uses a fresh connection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .expect("build client")
}
