//! Per-request scope carried through the processing chain.
//!
//! # Responsibilities
//! - Expose the parsed request (method, path, query, headers, body)
//! - Hold route parameters captured by the matching pattern
//! - Provide an insertion-ordered, string-keyed store of shared values
//! - Own the response sink and the request's cancellation token
//! - Implement `stop`: commit a final status and refuse further output
//!
//! # Data Flow
//! ```text
//! dispatch ──> RequestScope ──> step ──> step ──> step
//!                  │                       │
//!                  │ take_body()           │ send_* / stop()
//!                  ▼                       ▼
//!             request body            ResponseSink ──> HTTP response
//! ```

pub mod sink;

use std::any::Any;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, HOST, LOCATION};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use sink::{ResponseHead, ResponseSink, SinkError};

/// Context handed to every step of a request's chain.
///
/// The body slot sits behind a mutex solely to keep the scope `Sync`
/// (`Body` itself is not); it is locked only by `take_body`.
pub struct RequestScope {
    parts: Parts,
    body: Mutex<Option<Body>>,
    params: Vec<String>,
    data: Vec<(String, Arc<dyn Any + Send + Sync>)>,
    stopped: bool,
    sink: Arc<ResponseSink>,
    cancel: CancellationToken,
}

impl RequestScope {
    pub fn new(
        parts: Parts,
        body: Body,
        params: Vec<String>,
        sink: Arc<ResponseSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            parts,
            body: Mutex::new(Some(body)),
            params,
            data: Vec::new(),
            stopped: false,
            sink,
            cancel,
        }
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    /// Raw query string, without the leading `?`. Empty when absent.
    pub fn query(&self) -> &str {
        self.parts.uri.query().unwrap_or("")
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// A single request header as UTF-8, or `None` when missing or not
    /// representable as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Host the client addressed, from the `Host` header or the request
    /// target's authority.
    pub fn host(&self) -> &str {
        if let Some(host) = self.header(HOST.as_str()) {
            return host;
        }
        self.parts
            .uri
            .authority()
            .map(|a| a.as_str())
            .unwrap_or("")
    }

    /// Whether the request carries the `X-Requested-With: XMLHttpRequest`
    /// marker common to browser AJAX layers.
    pub fn is_ajax(&self) -> bool {
        self.header("x-requested-with")
            .is_some_and(|v| v.eq_ignore_ascii_case("xmlhttprequest"))
    }

    /// Take the request body. Returns `None` once consumed.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.get_mut().expect("body lock poisoned").take()
    }

    /// Route parameters captured by the matching pattern, in capture order.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// The `index`-th captured parameter, or `""` when out of range.
    pub fn param(&self, index: usize) -> &str {
        self.params.get(index).map(String::as_str).unwrap_or("")
    }

    /// Store a value under `key`. A second `put` under the same key replaces
    /// the value in place, keeping its insertion position.
    pub fn put<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> &mut Self {
        self.put_shared(key, Arc::new(value))
    }

    /// Store an already-shared value under `key`.
    pub fn put_shared(
        &mut self,
        key: impl Into<String>,
        value: Arc<dyn Any + Send + Sync>,
    ) -> &mut Self {
        let key = key.into();
        match self.data.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.data.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.data.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Typed lookup; `None` when the key is absent or holds another type.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Keys of the stored values, in insertion order.
    pub fn data_keys(&self) -> impl Iterator<Item = &str> {
        self.data.iter().map(|(k, _)| k.as_str())
    }

    pub fn sink(&self) -> &Arc<ResponseSink> {
        &self.sink
    }

    /// Token cancelled when the client abandons the request.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// End the request with `status`. The first call commits the status and
    /// terminates the body stream; later calls are no-ops.
    pub fn stop(&mut self, status: StatusCode) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.sink.commit(status);
        self.sink.terminate();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stage a response header. Silently ignores names or values the HTTP
    /// layer rejects.
    pub fn set_header(&self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => self.sink.insert_header(name, value),
            _ => tracing::debug!(name, value, "dropping invalid response header"),
        }
    }

    /// Commit a redirect to `location` and end the request.
    pub fn redirect(&mut self, location: &str, status: StatusCode) {
        if let Ok(value) = HeaderValue::from_str(location) {
            self.sink.insert_header(LOCATION, value);
        }
        self.stop(status);
    }

    /// Write raw bytes to the response body.
    pub async fn send_bytes(&self, chunk: Bytes) -> Result<(), SinkError> {
        self.sink.write(chunk).await
    }

    /// Write a string to the response body.
    pub async fn send_str(&self, text: &str) -> Result<(), SinkError> {
        self.sink.write(Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// Serialize `value` as JSON, set the content type, and write it.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SinkError> {
        self.set_header("content-type", "application/json; charset=utf-8");
        let buf = serde_json::to_vec(value)?;
        self.sink.write(Bytes::from(buf)).await
    }

    /// Commit a 200 head if nothing committed one during the chain. Called
    /// by dispatch after the chain finishes so every request produces a
    /// response.
    pub fn finish(&self) {
        if !self.sink.is_committed() {
            self.sink.commit(StatusCode::OK);
        }
    }
}
