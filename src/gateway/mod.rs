//! CGI gateway step: one subprocess per request.
//!
//! # Responsibilities
//! - Assemble the subprocess environment and argument vector
//! - Spawn the configured binary with all three pipes attached
//! - Bridge request body, response stream, and diagnostics concurrently
//! - Reap the subprocess, enforcing the step timeout and client cancellation
//!
//! # Design Decisions
//! - The environment is built from scratch (`env_clear`); the gateway's own
//!   environment never leaks into CGI programs
//! - `kill_on_drop` backstops every early-return path so no subprocess
//!   outlives its request
//! - The stdout translator is joined after the subprocess is reaped, under
//!   a short grace so a pipe held open by a grandchild cannot stall the
//!   request; within the grace the verdict sees a settled commit state
//! - Setup failures and abnormal exits end the request with a bodyless 500
//!   and stop the chain; a clean exit lets the chain continue

pub mod bridge;
pub mod env;

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::chain::{ChainError, Flow, Step, StepCore};
use crate::observability::metrics;
use crate::scope::RequestScope;

pub use env::CGI_OPTIONS_KEY;

/// Static configuration of one CGI target.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Path of the binary to execute.
    pub bin: String,
    /// Fixed arguments, always passed first.
    #[serde(default)]
    pub args: Vec<String>,
    /// Fixed environment entries, applied last so they override the
    /// CGI-standard and header-derived variables on collision.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// How long to wait for the stdout translator after the child is reaped.
const TRANSLATOR_GRACE: Duration = Duration::from_millis(250);

enum Reaped {
    Exited(std::io::Result<std::process::ExitStatus>),
    Aborted(&'static str),
}

/// End the request with a 500 unless some response head is already on the
/// wire; a committed response is never altered after the fact.
fn fail_uncommitted(scope: &mut RequestScope) {
    if !scope.sink().is_committed() {
        scope.stop(StatusCode::INTERNAL_SERVER_ERROR);
    }
}

/// Chain step that runs a CGI program for each request.
pub struct CgiGateway {
    core: StepCore,
    config: GatewayConfig,
}

impl CgiGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            core: StepCore::new("cgi"),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Settle a failed invocation: 500 unless a head is already committed.
    /// A translator still parked past the grace is aborted so the doomed
    /// response's body channel closes instead of lingering with the pipe.
    fn fail(
        &self,
        scope: &mut RequestScope,
        translator: &tokio::task::JoinHandle<()>,
        settled: bool,
    ) {
        fail_uncommitted(scope);
        if !settled {
            translator.abort();
        }
    }
}

#[async_trait]
impl Step for CgiGateway {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn timeout_ms(&self) -> u64 {
        self.core.timeout_ms()
    }

    fn set_timeout_ms(&mut self, ms: u64) {
        self.core.set_timeout_ms(ms);
    }

    async fn execute(&self, scope: &mut RequestScope) -> Flow {
        let env = env::build_env(&self.config, scope);
        let args = env::build_args(&self.config, scope);
        tracing::debug!(bin = %self.config.bin, ?args, "invoking cgi program");

        let mut command = Command::new(&self.config.bin);
        command
            .args(&args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracing::error!(%error, bin = %self.config.bin, "failed to spawn cgi program");
                metrics::record_cgi_invocation("spawn_error");
                scope.stop(StatusCode::INTERNAL_SERVER_ERROR);
                return Flow::Stop;
            }
        };
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            tracing::error!(bin = %self.config.bin, "cgi pipes unavailable");
            metrics::record_cgi_invocation("setup_error");
            scope.stop(StatusCode::INTERNAL_SERVER_ERROR);
            return Flow::Stop;
        };

        tokio::spawn(bridge::feed_stdin(scope.take_body(), stdin));
        let mut translator =
            tokio::spawn(bridge::translate_stdout(stdout, Arc::clone(scope.sink())));
        tokio::spawn(bridge::collect_stderr(stderr));

        let cancel = scope.cancellation().clone();
        let timeout_ms = self.core.timeout_ms();
        let reaped = if timeout_ms > 0 {
            tokio::select! {
                status = child.wait() => Reaped::Exited(status),
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => Reaped::Aborted("timeout"),
                _ = cancel.cancelled() => Reaped::Aborted("cancelled"),
            }
        } else {
            tokio::select! {
                status = child.wait() => Reaped::Exited(status),
                _ = cancel.cancelled() => Reaped::Aborted("cancelled"),
            }
        };

        if let Reaped::Aborted(reason) = &reaped {
            tracing::warn!(bin = %self.config.bin, reason, "killing cgi program");
            if let Err(error) = child.kill().await {
                tracing::error!(%error, bin = %self.config.bin, "failed to kill cgi program");
            }
        }
        // Join the translator so the commit state is settled before the
        // verdict. The join is bounded: a killed child can leave a
        // grandchild holding the stdout pipe open, and the request must
        // not outlive its timeout waiting for an EOF that never comes.
        let settled = tokio::time::timeout(TRANSLATOR_GRACE, &mut translator)
            .await
            .is_ok();
        if !settled {
            tracing::debug!(bin = %self.config.bin, "cgi stdout still open after reap");
        }

        match reaped {
            Reaped::Exited(Ok(status)) if status.success() => {
                // On a clean exit an unsettled translator is a slow client
                // draining a legitimate stream; leave it running detached.
                metrics::record_cgi_invocation("completed");
                Flow::Continue
            }
            Reaped::Exited(Ok(status)) => {
                tracing::warn!(bin = %self.config.bin, exit = ?status.code(), "cgi program exited abnormally");
                metrics::record_cgi_invocation("failed");
                self.fail(scope, &translator, settled);
                Flow::Stop
            }
            Reaped::Exited(Err(error)) => {
                tracing::error!(%error, bin = %self.config.bin, "failed to reap cgi program");
                metrics::record_cgi_invocation("wait_error");
                self.fail(scope, &translator, settled);
                Flow::Stop
            }
            Reaped::Aborted(reason) => {
                metrics::record_cgi_invocation(reason);
                self.fail(scope, &translator, settled);
                Flow::Stop
            }
        }
    }

    fn next(&self) -> Option<&dyn Step> {
        self.core.next()
    }

    fn next_mut(&mut self) -> Option<&mut (dyn Step + 'static)> {
        self.core.next_mut()
    }

    fn link(&mut self, next: Box<dyn Step>) -> Result<(), ChainError> {
        self.core.link(next)
    }
}
