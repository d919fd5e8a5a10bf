//! Processing chain: a linked list of steps executed per request.
//!
//! # Responsibilities
//! - Define the `Step` trait every chain node implements
//! - Provide `StepCore`, the embeddable name/timeout/successor state
//! - Run a chain head-to-tail, honoring `Flow::Stop` and stopped scopes
//! - Wrap plain async closures as steps (`FnStep`)
//!
//! # Design Decisions
//! - Steps return an explicit `Flow` verdict; the runner owns advancement,
//!   so a step cannot stall the chain by forgetting a bookkeeping call
//! - Linking a successor onto a node that already has one is a build-time
//!   error, not a runtime panic
//! - Timeouts live on the nodes; `set_timeout_all` walks a whole chain

use std::fmt;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::scope::RequestScope;

/// Verdict of one step: keep going or end the chain here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Errors raised while assembling a chain.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A node may carry exactly one successor.
    #[error("step {step:?} already has a successor")]
    AlreadyLinked { step: String },
}

/// One node in a request's processing chain.
#[async_trait]
pub trait Step: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Per-step timeout in milliseconds; `0` means unbounded.
    fn timeout_ms(&self) -> u64;

    /// Set the timeout. Values of `0` are ignored.
    fn set_timeout_ms(&mut self, ms: u64);

    /// Do the work. Runs with exclusive access to the scope.
    async fn execute(&self, scope: &mut RequestScope) -> Flow;

    fn next(&self) -> Option<&dyn Step>;

    fn next_mut(&mut self) -> Option<&mut (dyn Step + 'static)>;

    /// Attach the successor node. Fails if one is already attached.
    fn link(&mut self, next: Box<dyn Step>) -> Result<(), ChainError>;

    /// Release resources held by the step. Called once when the owning
    /// route is torn down. The default does nothing.
    fn close(&mut self) {}
}

impl fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name()).finish()
    }
}

/// Common state embedded by concrete steps: name, timeout, successor.
pub struct StepCore {
    name: String,
    timeout_ms: u64,
    next: Option<Box<dyn Step>>,
}

impl StepCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_ms: 0,
            next: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn set_timeout_ms(&mut self, ms: u64) {
        if ms > 0 {
            self.timeout_ms = ms;
        }
    }

    pub fn next(&self) -> Option<&dyn Step> {
        self.next.as_deref()
    }

    pub fn next_mut(&mut self) -> Option<&mut (dyn Step + 'static)> {
        self.next.as_deref_mut()
    }

    pub fn link(&mut self, next: Box<dyn Step>) -> Result<(), ChainError> {
        if self.next.is_some() {
            return Err(ChainError::AlreadyLinked {
                step: self.name.clone(),
            });
        }
        self.next = Some(next);
        Ok(())
    }
}

/// Append `next` after the last node reachable from `head`.
pub fn link_tail(head: &mut dyn Step, next: Box<dyn Step>) -> Result<(), ChainError> {
    if head.next().is_none() {
        return head.link(next);
    }
    if let Some(tail) = head.next_mut() {
        link_tail(tail, next)
    } else {
        Ok(())
    }
}

/// Set the timeout on every node reachable from `head`.
pub fn set_timeout_all(head: &mut dyn Step, ms: u64) {
    head.set_timeout_ms(ms);
    if let Some(next) = head.next_mut() {
        set_timeout_all(next, ms);
    }
}

/// Close every node reachable from `head`, front to back.
pub fn close_all(head: &mut dyn Step) {
    head.close();
    if let Some(next) = head.next_mut() {
        close_all(next);
    }
}

/// Fold a list of steps into a single chain, preserving order.
pub fn chain_steps(steps: Vec<Box<dyn Step>>) -> Result<Option<Box<dyn Step>>, ChainError> {
    let mut head: Option<Box<dyn Step>> = None;
    for mut step in steps.into_iter().rev() {
        if let Some(tail) = head.take() {
            step.link(tail)?;
        }
        head = Some(step);
    }
    Ok(head)
}

/// Execute the chain from `head`. Stops when a step returns `Flow::Stop`
/// or stops the scope; otherwise advances to the successor.
pub async fn run(head: &dyn Step, scope: &mut RequestScope) {
    let mut current = Some(head);
    while let Some(step) = current {
        tracing::trace!(step = step.name(), "executing step");
        let flow = step.execute(scope).await;
        if scope.is_stopped() || flow == Flow::Stop {
            break;
        }
        current = step.next();
    }
}

type StepFn = Box<dyn for<'a> Fn(&'a mut RequestScope) -> BoxFuture<'a, Flow> + Send + Sync>;

/// A step backed by an async closure.
pub struct FnStep {
    core: StepCore,
    f: StepFn,
}

impl FnStep {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut RequestScope) -> BoxFuture<'a, Flow> + Send + Sync + 'static,
    {
        Self {
            core: StepCore::new("function"),
            f: Box::new(f),
        }
    }

    pub fn named<F>(name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut RequestScope) -> BoxFuture<'a, Flow> + Send + Sync + 'static,
    {
        Self {
            core: StepCore::new(name),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Step for FnStep {
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
        (self.f)(scope).await
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

/// A step that logs the request line and continues.
pub fn request_logging_step() -> Box<dyn Step> {
    Box::new(FnStep::named("logging", |scope| {
        Box::pin(async move {
            tracing::info!(method = %scope.method(), path = scope.path(), "request");
            Flow::Continue
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tokio_util::sync::CancellationToken;

    use crate::scope::ResponseSink;

    fn test_scope() -> RequestScope {
        let (parts, body) = Request::builder()
            .method(Method::GET)
            .uri("/x")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let (sink, head_rx, body_rx) = ResponseSink::channel(4);
        // The chain tests never complete a response.
        std::mem::forget((head_rx, body_rx));
        RequestScope::new(parts, body, vec![], sink, CancellationToken::new())
    }

    fn tracing_step(label: &'static str) -> Box<dyn Step> {
        Box::new(FnStep::named(label, move |scope| {
            Box::pin(async move {
                let mut seen = scope
                    .get_as::<Vec<&'static str>>("seen")
                    .cloned()
                    .unwrap_or_default();
                seen.push(label);
                scope.put("seen", seen);
                Flow::Continue
            })
        }))
    }

    fn seen(scope: &RequestScope) -> Vec<&'static str> {
        scope
            .get_as::<Vec<&'static str>>("seen")
            .cloned()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn runs_in_link_order() {
        let head = chain_steps(vec![tracing_step("a"), tracing_step("b"), tracing_step("c")])
            .unwrap()
            .unwrap();
        let mut scope = test_scope();
        run(head.as_ref(), &mut scope).await;
        assert_eq!(seen(&scope), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn stop_flow_short_circuits() {
        let stopper: Box<dyn Step> =
            Box::new(FnStep::new(|_| Box::pin(async { Flow::Stop })));
        let head = chain_steps(vec![tracing_step("a"), stopper, tracing_step("b")])
            .unwrap()
            .unwrap();
        let mut scope = test_scope();
        run(head.as_ref(), &mut scope).await;
        assert_eq!(seen(&scope), ["a"]);
    }

    #[tokio::test]
    async fn stopped_scope_short_circuits() {
        let stopper: Box<dyn Step> = Box::new(FnStep::new(|scope| {
            Box::pin(async move {
                scope.stop(StatusCode::FORBIDDEN);
                Flow::Continue
            })
        }));
        let head = chain_steps(vec![stopper, tracing_step("b")])
            .unwrap()
            .unwrap();
        let mut scope = test_scope();
        run(head.as_ref(), &mut scope).await;
        assert_eq!(seen(&scope), Vec::<&str>::new());
        assert!(scope.is_stopped());
    }

    #[test]
    fn double_link_is_an_error() {
        let mut a = FnStep::named("a", |_| Box::pin(async { Flow::Continue }));
        a.link(tracing_step("b")).unwrap();
        let err = a.link(tracing_step("c")).unwrap_err();
        assert!(matches!(err, ChainError::AlreadyLinked { step } if step == "a"));
    }

    #[test]
    fn link_tail_appends_and_timeout_walks() {
        let mut head = chain_steps(vec![tracing_step("a"), tracing_step("b")])
            .unwrap()
            .unwrap();
        link_tail(head.as_mut(), tracing_step("c")).unwrap();
        set_timeout_all(head.as_mut(), 250);
        let mut node: Option<&dyn Step> = Some(head.as_ref());
        let mut count = 0;
        while let Some(step) = node {
            assert_eq!(step.timeout_ms(), 250);
            count += 1;
            node = step.next();
        }
        assert_eq!(count, 3);
    }
}
