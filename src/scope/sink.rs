//! Response sink: the single write path from a request's processing chain
//! to the HTTP response.
//!
//! # Responsibilities
//! - Stage response headers before the status is committed
//! - Commit the status line exactly once (first commit wins)
//! - Stream body bytes through a bounded channel
//! - Guarantee no byte is written after termination
//!
//! # Design Decisions
//! - Head travels over a oneshot channel, body over a bounded mpsc channel;
//!   the dispatch handler turns the pair into a streaming response
//! - A write before any commit implies a 200 commit, matching the behavior
//!   CGI programs expect from a web server's response writer
//! - Termination is sticky: once set, writes fail forever

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Error type for sink writes.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The response was terminated (`stop` or a prior write failure);
    /// no further body bytes are accepted.
    #[error("response terminated")]
    Terminated,
    /// The client side of the response is gone.
    #[error("client disconnected")]
    Disconnected,
    /// A value could not be encoded for the response body.
    #[error("json encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Committed status line and headers, sent to the dispatch handler once.
#[derive(Debug)]
pub struct ResponseHead {
    /// Final response status.
    pub status: StatusCode,
    /// Headers staged before the commit.
    pub headers: HeaderMap,
}

struct HeadState {
    tx: Option<oneshot::Sender<ResponseHead>>,
    headers: HeaderMap,
}

/// Write side of one in-flight response.
///
/// Exactly one component writes body bytes at a time during an invocation;
/// the commit itself is serialized internally so a racing `stop` and a
/// streaming translator cannot both set a status.
pub struct ResponseSink {
    head: Mutex<HeadState>,
    body_tx: mpsc::Sender<Bytes>,
    terminated: AtomicBool,
}

impl ResponseSink {
    /// Create a sink plus the receiving halves used to build the response.
    pub fn channel(
        body_capacity: usize,
    ) -> (
        Arc<Self>,
        oneshot::Receiver<ResponseHead>,
        mpsc::Receiver<Bytes>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(body_capacity);
        let sink = Arc::new(Self {
            head: Mutex::new(HeadState {
                tx: Some(head_tx),
                headers: HeaderMap::new(),
            }),
            body_tx,
            terminated: AtomicBool::new(false),
        });
        (sink, head_rx, body_rx)
    }

    /// Stage a header for the eventual commit. Later insertions of the same
    /// name replace earlier ones. Ignored after the head is committed.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        let mut head = self.head.lock().expect("sink lock poisoned");
        if head.tx.is_some() {
            head.headers.insert(name, value);
        }
    }

    /// Commit the status line with all staged headers. Only the first call
    /// has any effect; returns whether this call performed the commit.
    pub fn commit(&self, status: StatusCode) -> bool {
        let mut head = self.head.lock().expect("sink lock poisoned");
        let Some(tx) = head.tx.take() else {
            return false;
        };
        let headers = std::mem::take(&mut head.headers);
        if tx.send(ResponseHead { status, headers }).is_err() {
            // Client went away before the head was ever sent.
            self.terminated.store(true, Ordering::SeqCst);
        }
        true
    }

    /// Whether the status line has been committed.
    pub fn is_committed(&self) -> bool {
        self.head.lock().expect("sink lock poisoned").tx.is_none()
    }

    /// Write a body chunk. Commits a 200 head first if nothing has been
    /// committed yet.
    pub async fn write(&self, chunk: Bytes) -> Result<(), SinkError> {
        if self.is_terminated() {
            return Err(SinkError::Terminated);
        }
        if !self.is_committed() {
            self.commit(StatusCode::OK);
        }
        self.body_tx.send(chunk).await.map_err(|_| {
            self.terminated.store(true, Ordering::SeqCst);
            SinkError::Disconnected
        })
    }

    /// Forbid any further body bytes. Sticky.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Whether the sink no longer accepts body bytes.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_commit_wins() {
        let (sink, head_rx, _body_rx) = ResponseSink::channel(4);
        assert!(sink.commit(StatusCode::NOT_FOUND));
        assert!(!sink.commit(StatusCode::OK));
        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn write_auto_commits_ok() {
        let (sink, head_rx, mut body_rx) = ResponseSink::channel(4);
        sink.write(Bytes::from_static(b"hello")).await.unwrap();
        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(body_rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn staged_headers_travel_with_commit() {
        let (sink, head_rx, _body_rx) = ResponseSink::channel(4);
        sink.insert_header(
            HeaderName::from_static("x-foo"),
            HeaderValue::from_static("one"),
        );
        sink.insert_header(
            HeaderName::from_static("x-foo"),
            HeaderValue::from_static("two"),
        );
        sink.commit(StatusCode::OK);
        let head = head_rx.await.unwrap();
        assert_eq!(head.headers.get("x-foo").unwrap(), "two");
    }

    #[tokio::test]
    async fn no_bytes_after_terminate() {
        let (sink, _head_rx, mut body_rx) = ResponseSink::channel(4);
        sink.write(Bytes::from_static(b"a")).await.unwrap();
        sink.terminate();
        assert!(matches!(
            sink.write(Bytes::from_static(b"b")).await,
            Err(SinkError::Terminated)
        ));
        assert_eq!(body_rx.recv().await.unwrap(), Bytes::from_static(b"a"));
        // Channel still open (sink alive) but nothing further was sent.
        assert!(body_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn write_fails_when_client_gone() {
        let (sink, _head_rx, body_rx) = ResponseSink::channel(1);
        drop(body_rx);
        let result = sink.write(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(SinkError::Disconnected)));
        assert!(sink.is_terminated());
    }
}
