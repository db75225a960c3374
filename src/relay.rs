//! Relaying upstream responses back to the client.
//!
//! Three shapes:
//! - **event stream**: upstream bytes are re-framed line by line into SSE
//!   frames and forwarded as they arrive ([`sse_frames`], [`LineFramer`]).
//! - **buffered JSON**: the whole body is read inside the attempt.
//! - **pass-through**: status, headers and body copied from upstream, minus
//!   hop-by-hop headers ([`Passthrough`]).
//!
//! The first SSE frame is pulled inside the dispatch attempt ([`prime`]) so a
//! proxy that dies before producing anything can still be retried. After
//! that the response is committed and a read error aborts the body.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::dispatch::AttemptError;

/// An upstream read failure surfaced through a relayed stream.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream stream error: {0}")]
pub struct RelayError(pub String);

/// SSE frames ready to be written to the client.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

/// Reassembles lines across chunk boundaries and turns each into an SSE frame.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the frames for every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            if let Some(frame) = frame_line(&self.buffer[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        frames
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<Bytes> {
        let rest = std::mem::take(&mut self.buffer);
        frame_line(&rest)
    }
}

/// Frame one raw line as `data: <payload>\n\n`. Blank lines produce nothing.
pub fn frame_line(line: &[u8]) -> Option<Bytes> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let frame = if line.starts_with("data:") {
        format!("{}\n\n", line)
    } else {
        format!("data: {}\n\n", line)
    };
    Some(Bytes::from(frame))
}

struct FrameState {
    upstream: Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>,
    framer: LineFramer,
    pending: VecDeque<Bytes>,
    finished: bool,
}

/// Re-frame a raw byte stream into SSE frames.
///
/// Each frame is yielded as soon as its line is complete. An upstream error
/// is yielded once and ends the stream.
pub fn sse_frames<S, E>(upstream: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + 'static,
{
    let state = FrameState {
        upstream: Box::pin(upstream.map(|item| item.map_err(|e| RelayError(e.to_string())))),
        framer: LineFramer::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.finished {
                return None;
            }
            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.framer.push(&chunk);
                    state.pending.extend(frames);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.finished = true;
                    state.pending.extend(state.framer.finish());
                }
            }
        }
    }))
}

/// An event stream whose first frame has already arrived.
pub struct PrimedStream {
    first: Bytes,
    rest: EventStream,
}

impl fmt::Debug for PrimedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimedStream")
            .field("first", &self.first)
            .finish_non_exhaustive()
    }
}

/// Wait for the first frame. Failing here is an attempt failure.
pub async fn prime(mut frames: EventStream) -> Result<PrimedStream, AttemptError> {
    match frames.next().await {
        Some(Ok(first)) => Ok(PrimedStream {
            first,
            rest: frames,
        }),
        Some(Err(e)) => Err(AttemptError::Relay(e.0)),
        None => Err(AttemptError::Relay(
            "upstream closed the stream before any data".to_string(),
        )),
    }
}

/// End `frames` with an error when no frame arrives for `idle`.
pub fn idle_bounded(frames: EventStream, idle: Duration) -> EventStream {
    Box::pin(futures::stream::unfold(Some(frames), move |frames| async move {
        let mut frames = frames?;
        match tokio::time::timeout(idle, frames.next()).await {
            Ok(Some(item)) => Some((item, Some(frames))),
            Ok(None) => None,
            Err(_) => Some((
                Err(RelayError(format!(
                    "no data from upstream for {}s",
                    idle.as_secs()
                ))),
                None,
            )),
        }
    }))
}

/// Commit a primed stream to the client as `text/event-stream`.
///
/// Every frame after the first must arrive within `idle`. `on_error` runs
/// once if the upstream fails or stalls after commit; the body then ends
/// with an error so the client sees an aborted transfer. `guard` is held
/// until the body is dropped.
pub fn event_stream_response<F, G>(
    primed: PrimedStream,
    idle: Duration,
    on_error: F,
    guard: G,
) -> Response
where
    F: FnOnce(&RelayError) + Send + 'static,
    G: Send + 'static,
{
    let PrimedStream { first, rest } = primed;
    let mut on_error = Some(on_error);

    let frames = futures::stream::once(async move { Ok(first) })
        .chain(idle_bounded(rest, idle))
        .map(move |item| {
            let _held = &guard;
            if let Err(e) = &item {
                if let Some(callback) = on_error.take() {
                    callback(e);
                }
            }
            item
        });

    let mut response = Response::new(Body::from_stream(frames));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Turn a non-2xx upstream response into an attempt failure.
pub async fn accept(response: reqwest::Response) -> Result<reqwest::Response, AttemptError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AttemptError::rejected(status.as_u16(), &body))
}

/// Read a whole JSON body inside the attempt.
///
/// A body that is not JSON (a proxy's own error page, say) fails the attempt.
pub async fn read_json(response: reqwest::Response) -> Result<Bytes, AttemptError> {
    let body = response
        .bytes()
        .await
        .map_err(|e| AttemptError::Relay(e.without_url().to_string()))?;

    if serde_json::from_slice::<serde_json::Value>(&body).is_err() {
        return Err(AttemptError::Relay(
            "upstream returned a non-JSON body".to_string(),
        ));
    }
    Ok(body)
}

/// Buffered JSON response with a synthesized header set.
pub fn json_response(body: Bytes) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

/// Headers that describe the upstream connection rather than the payload.
fn is_hop_by_hop(name: &header::HeaderName) -> bool {
    let name = name.as_str();
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
            | "content-length"
    ) || name.starts_with("proxy-")
}

/// A fully read upstream response, relayed as-is.
#[derive(Debug)]
pub struct Passthrough {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Passthrough {
    /// Read the response inside the attempt.
    pub async fn read(response: reqwest::Response) -> Result<Self, AttemptError> {
        let status = response.status();
        let mut headers = response.headers().clone();
        let names: Vec<_> = headers
            .keys()
            .filter(|name| is_hop_by_hop(name))
            .cloned()
            .collect();
        for name in names {
            headers.remove(&name);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Relay(e.without_url().to_string()))?;

        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

impl IntoResponse for Passthrough {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
