//! Pipe bridging between a CGI subprocess and the HTTP exchange.
//!
//! # Responsibilities
//! - Feed the request body into the subprocess stdin, then close it
//! - Translate subprocess stdout: parse the CGI header block, commit the
//!   response head, stream the remainder as the body
//! - Surface subprocess stderr through the gateway's own logs
//!
//! # Data Flow
//! ```text
//! request body ──> feed ──> [stdin]   subprocess   [stdout] ──> translate ──> sink
//!                                         [stderr] ──> collect ──> warn logs
//! ```

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::scope::ResponseSink;

/// Read/write unit for all three pipes.
const CHUNK_SIZE: usize = 512;

/// Copy the request body into the subprocess stdin and close the pipe.
/// A zero-byte body closes stdin immediately with nothing written.
pub(crate) async fn feed_stdin<W>(body: Option<Body>, mut stdin: W)
where
    W: AsyncWrite + Unpin,
{
    if let Some(body) = body {
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Err(error) = stdin.write_all(&bytes).await {
                        tracing::debug!(%error, "cgi stdin write failed");
                        break;
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "request body read failed");
                    break;
                }
            }
        }
    }
    let _ = stdin.shutdown().await;
}

/// Parse the CGI header block from stdout, commit the response head, then
/// stream the rest of stdout as the response body.
///
/// Only the bytes of the current read are scanned for the header/body
/// separator. A separator that straddles two reads is never detected and
/// the output is accumulated as headers until the pipe closes. Programs
/// that emit their header block in a single write are unaffected.
pub(crate) async fn translate_stdout<R>(mut stdout: R, sink: Arc<ResponseSink>)
where
    R: AsyncRead + Unpin,
{
    let separator =
        regex::bytes::Regex::new(r"\r?\n\r?\n").expect("separator pattern is valid");
    let mut buf = [0u8; CHUNK_SIZE];
    let mut header_buf: Vec<u8> = Vec::new();
    let mut reading_headers = true;

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) => {
                tracing::debug!(%error, "cgi stdout read failed");
                break;
            }
        };
        let chunk = &buf[..n];

        if reading_headers {
            let Some(m) = separator.find(chunk) else {
                header_buf.extend_from_slice(chunk);
                continue;
            };
            header_buf.extend_from_slice(&chunk[..m.start()]);
            reading_headers = false;

            let status = apply_header_block(&header_buf, &sink);
            if sink.is_terminated() {
                break;
            }
            sink.commit(status.unwrap_or(StatusCode::OK));
            let rest = &chunk[m.end()..];
            if !rest.is_empty() && sink.write(Bytes::copy_from_slice(rest)).await.is_err() {
                break;
            }
        } else if sink.write(Bytes::copy_from_slice(chunk)).await.is_err() {
            break;
        }
    }
}

/// Relay stderr output into the gateway log at warn level, verbatim.
pub(crate) async fn collect_stderr<R>(mut stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tracing::warn!(output = %String::from_utf8_lossy(&buf[..n]), "cgi stderr");
            }
        }
    }
}

/// Parse one header block: stage every header on the sink and return the
/// status the block declared, if any.
///
/// `Status:` lines set the status from the leading integer of their value
/// and are never forwarded as headers. Lines without a colon are matched
/// against a status-line shape (`HTTP/<version> <3-digit code>`). Later
/// declarations override earlier ones throughout.
fn apply_header_block(raw: &[u8], sink: &ResponseSink) -> Option<StatusCode> {
    let status_line = Regex::new(r"^HTTP/\S+\s+(\d{3})").expect("status pattern is valid");
    let text = String::from_utf8_lossy(raw);
    let mut status = None;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("status") {
                if let Some(code) = parse_status(value) {
                    status = Some(code);
                }
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => sink.insert_header(name, value),
                _ => tracing::debug!(name, value, "dropping invalid cgi header"),
            }
        } else if let Some(captures) = status_line.captures(line) {
            if let Some(code) = parse_status(&captures[1]) {
                status = Some(code);
            }
        }
    }
    status
}

/// Leading integer of a `Status:` value, e.g. `404 Not Found` -> 404.
fn parse_status(value: &str) -> Option<StatusCode> {
    let code = value.split_whitespace().next()?.parse::<u16>().ok()?;
    StatusCode::from_u16(code).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    #[tokio::test]
    async fn single_chunk_header_block_with_status_header() {
        let output = b"Status: 404 Not Found\r\nX-Foo: bar\r\n\r\nbody".to_vec();
        let (sink, head_rx, mut body_rx) = ResponseSink::channel(8);
        translate_stdout(Cursor::new(output), sink).await;

        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(head.headers.get("x-foo").unwrap(), "bar");
        assert!(head.headers.get("status").is_none());
        assert_eq!(body_rx.recv().await.unwrap(), Bytes::from_static(b"body"));
    }

    #[tokio::test]
    async fn status_line_shape_sets_code() {
        let output = b"HTTP/1.1 503 Service Unavailable\nRetry-After: 1\n\n".to_vec();
        let (sink, head_rx, _body_rx) = ResponseSink::channel(8);
        translate_stdout(Cursor::new(output), sink).await;

        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(head.headers.get("retry-after").unwrap(), "1");
    }

    #[tokio::test]
    async fn missing_status_defaults_to_200() {
        let output = b"Content-Type: text/plain\n\nhello".to_vec();
        let (sink, head_rx, mut body_rx) = ResponseSink::channel(8);
        translate_stdout(Cursor::new(output), sink).await;

        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(body_rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn later_header_occurrence_wins() {
        let output = b"X-A: one\nX-A: two\nStatus: 201\nStatus: 202\n\n".to_vec();
        let (sink, head_rx, _body_rx) = ResponseSink::channel(8);
        translate_stdout(Cursor::new(output), sink).await;

        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::ACCEPTED);
        assert_eq!(head.headers.get("x-a").unwrap(), "two");
    }

    #[tokio::test]
    async fn status_header_name_is_case_insensitive() {
        let output = b"status: 418\nSTATUS: 503\nX-K: v\n\n".to_vec();
        let (sink, head_rx, _body_rx) = ResponseSink::channel(8);
        translate_stdout(Cursor::new(output), sink).await;

        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::SERVICE_UNAVAILABLE);
        // Neither spelling is forwarded as a header.
        assert!(head.headers.get("status").is_none());
        assert_eq!(head.headers.get("x-k").unwrap(), "v");
    }

    #[tokio::test]
    async fn separator_straddling_two_reads_is_never_detected() {
        // First read ends with half the blank line; second read starts with
        // the other half. Neither read alone contains the separator, so the
        // head is never committed.
        let (mut tx, rx) = tokio::io::duplex(1024);
        let (sink, head_rx, _body_rx) = ResponseSink::channel(8);
        let worker = tokio::spawn(translate_stdout(rx, sink));

        tx.write_all(b"Status: 404\r\nX-Foo: bar\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.write_all(b"\r\nbody").await.unwrap();
        drop(tx);

        worker.await.unwrap();
        assert!(head_rx.await.is_err());
    }

    #[tokio::test]
    async fn body_bytes_in_header_chunk_are_forwarded() {
        let output = b"X-K: v\n\nfirst".to_vec();
        let (sink, head_rx, mut body_rx) = ResponseSink::channel(8);
        translate_stdout(Cursor::new(output), sink).await;
        assert_eq!(head_rx.await.unwrap().status, StatusCode::OK);
        assert_eq!(body_rx.recv().await.unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn empty_header_block_streams_whole_body() {
        let output = b"\n\npayload".to_vec();
        let (sink, head_rx, mut body_rx) = ResponseSink::channel(8);
        translate_stdout(Cursor::new(output), sink).await;
        assert_eq!(head_rx.await.unwrap().status, StatusCode::OK);
        assert_eq!(
            body_rx.recv().await.unwrap(),
            Bytes::from_static(b"payload")
        );
    }

    #[tokio::test]
    async fn terminated_sink_suppresses_commit() {
        let output = b"Status: 200\n\nbody".to_vec();
        let (sink, head_rx, _body_rx) = ResponseSink::channel(8);
        sink.commit(StatusCode::INTERNAL_SERVER_ERROR);
        sink.terminate();
        translate_stdout(Cursor::new(output), Arc::clone(&sink)).await;
        // The 500 committed before the translator ran is what the client saw.
        assert_eq!(
            head_rx.await.unwrap().status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn feed_closes_stdin_for_empty_body() {
        let mut out = Vec::new();
        feed_stdin(Some(Body::empty()), &mut out).await;
        assert!(out.is_empty());

        let mut out = Vec::new();
        feed_stdin(Some(Body::from("abc")), &mut out).await;
        assert_eq!(out, b"abc");
    }
}
