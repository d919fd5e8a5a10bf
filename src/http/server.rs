//! HTTP server setup and request dispatch.
//!
//! # Responsibilities
//! - Create the Axum router; every request funnels into the dispatcher
//! - Wire up middleware (tracing) and a per-request ID
//! - Look up the route registry and run the matched chain
//! - Turn the chain's response sink into a streamed HTTP response
//! - Answer 501 when no route accepts the request line
//! - Contain chain panics: the client gets a 500, the server lives on
//!
//! # Design Decisions
//! - The chain runs in its own task; the handler only awaits the committed
//!   head and then hands the body channel to hyper. A chain that streams
//!   for minutes never blocks the handler pool
//! - The response body carries a drop guard: when the client goes away the
//!   request's cancellation token fires and the gateway kills its subprocess

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, Response, StatusCode},
    response::IntoResponse,
    Router,
};
use bytes::Bytes;
use futures_util::Stream;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::GatewayServerConfig;
use crate::observability::metrics;
use crate::routing::{Registry, RouteError};
use crate::scope::{RequestScope, ResponseSink};

/// Body chunks buffered between the chain and hyper before backpressure.
const BODY_CHANNEL_CAPACITY: usize = 32;

/// Application state injected into the dispatcher.
#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
}

/// HTTP server fronting the route registry.
pub struct GatewayServer {
    router: Router,
}

impl GatewayServer {
    /// Create a server around an already-built registry.
    pub fn new(registry: Registry) -> Self {
        let state = AppState {
            registry: Arc::new(registry),
        };
        let router = Router::new()
            .fallback(dispatch)
            .with_state(state)
            .layer(TraceLayer::new_for_http());
        Self { router }
    }

    /// Create a server with routes compiled from configuration.
    pub fn from_config(config: &GatewayServerConfig) -> Result<Self, RouteError> {
        Ok(Self::new(Registry::from_config(config)?))
    }

    /// Run the server, accepting connections on the given listener until
    /// the shutdown signal lands.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "gateway listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("gateway stopped");
        Ok(())
    }
}

/// Fallback handler: every request line goes through the registry.
async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    let started = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let Some((entry, params)) = state.registry.find(&method, &path) else {
        tracing::debug!(request_id, method = %method, path, "no route");
        metrics::record_request(method.as_str(), "none", 501, started);
        return (StatusCode::NOT_IMPLEMENTED, "Not Implemented").into_response();
    };
    tracing::debug!(
        request_id,
        method = %method,
        path,
        route = entry.pattern(),
        "dispatching"
    );

    let (parts, body) = request.into_parts();
    let (sink, head_rx, body_rx) = ResponseSink::channel(BODY_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let mut scope = RequestScope::new(parts, body, params, sink, cancel.clone());
    for (key, value) in entry.data() {
        scope.put_shared(key.clone(), Arc::clone(value));
    }

    let chain_entry = Arc::clone(&entry);
    tokio::spawn(async move {
        chain_entry.execute(&mut scope).await;
        scope.finish();
    });

    match head_rx.await {
        Ok(head) => {
            metrics::record_request(method.as_str(), entry.pattern(), head.status.as_u16(), started);
            let stream = GuardedBody {
                inner: ReceiverStream::new(body_rx),
                _cancel_on_drop: cancel.drop_guard(),
            };
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = head.status;
            *response.headers_mut() = head.headers;
            if let Ok(id) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert("x-request-id", id);
            }
            response
        }
        Err(_) => {
            // The chain task died before committing anything; the usual
            // cause is a panicking step.
            tracing::error!(request_id, route = entry.pattern(), "chain ended without a response");
            metrics::record_request(method.as_str(), entry.pattern(), 500, started);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Channel-backed body that cancels the request's token when dropped, so
/// a client disconnect reaches the gateway's subprocess.
struct GuardedBody {
    inner: ReceiverStream<Bytes>,
    _cancel_on_drop: DropGuard,
}

impl Stream for GuardedBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|opt| opt.map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Flow, FnStep, Step};
    use tokio::sync::mpsc;

    fn drain_guard(rx: mpsc::Receiver<Bytes>, cancel: CancellationToken) -> GuardedBody {
        GuardedBody {
            inner: ReceiverStream::new(rx),
            _cancel_on_drop: cancel.drop_guard(),
        }
    }

    #[tokio::test]
    async fn dropping_the_body_cancels_the_request_token() {
        let (_tx, rx) = mpsc::channel::<Bytes>(1);
        let cancel = CancellationToken::new();
        let body = drain_guard(rx, cancel.clone());
        assert!(!cancel.is_cancelled());
        drop(body);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn unmatched_request_gets_501() {
        let server = GatewayServer::new(Registry::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(server.run(listener, rx));

        let response = reqwest_get(addr, "/missing").await;
        assert_eq!(response.0, 501);
        let _ = tx.send(());
    }

    #[tokio::test]
    async fn chain_panic_is_contained_as_500() {
        let mut registry = Registry::new();
        let panicking: Vec<Box<dyn Step>> = vec![Box::new(FnStep::new(|_| {
            Box::pin(async { panic!("step blew up") })
        }))];
        registry.on_get("^/boom$", panicking).unwrap();
        let ok: Vec<Box<dyn Step>> = vec![Box::new(FnStep::new(|scope| {
            Box::pin(async move {
                let _ = scope.send_str("fine").await;
                Flow::Continue
            })
        }))];
        registry.on_get("^/fine$", ok).unwrap();

        let server = GatewayServer::new(registry);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(server.run(listener, rx));

        assert_eq!(reqwest_get(addr, "/boom").await.0, 500);
        // The server survives and keeps answering.
        let (status, body) = reqwest_get(addr, "/fine").await;
        assert_eq!(status, 200);
        assert_eq!(body, "fine");
        let _ = tx.send(());
    }

    async fn reqwest_get(addr: std::net::SocketAddr, path: &str) -> (u16, String) {
        let response = reqwest::Client::new()
            .get(format!("http://{addr}{path}"))
            .send()
            .await
            .expect("gateway unreachable");
        let status = response.status().as_u16();
        (status, response.text().await.unwrap_or_default())
    }
}
