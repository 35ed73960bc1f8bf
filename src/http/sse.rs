//! Server-sent events writer.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderName, HeaderValue};
use axum::response::Response;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};

use crate::cancellation::{CancellationToken, DropGuard};
use crate::route_error::RouteFailure;

pub(crate) const KEEP_ALIVE_FRAME: &[u8] = b":ok\n\n";

/// Reason recorded on the request signal when the client goes away.
pub const DISCONNECT_REASON: &str = "User disconnect.";

pub(crate) fn data_frame(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

pub(crate) fn error_frame(failure: RouteFailure) -> Bytes {
    Bytes::from(format!("error: {}\n\n", failure.into_route_error().to_json()))
}

/// Cancels the request signal if the stream is dropped before it finished.
struct Disconnect {
    guard: Option<DropGuard>,
    route: String,
}

impl Disconnect {
    fn finish(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
    }
}

impl Drop for Disconnect {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            debug!(route = %self.route, "SSE client disconnected");
        }
    }
}

enum Step {
    Event(Option<Result<Value, RouteFailure>>),
    KeepAlive,
    Cancelled,
}

/// Frames `events` and interleaves keep-alives every `keep_alive`.
///
/// The first keep-alive goes out one full interval after the stream starts.
/// The stream ends after the last event, after the first error (written as
/// an `error:` frame), or when `signal` is cancelled.
pub(crate) fn frames(
    events: BoxStream<'static, Result<Value, RouteFailure>>,
    signal: CancellationToken,
    keep_alive: Duration,
    route: String,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let mut disconnect = Disconnect {
        guard: Some(signal.drop_guard(DISCONNECT_REASON)),
        route,
    };
    async_stream::stream! {
        let mut events = events;
        let mut ticker = interval_at(Instant::now() + keep_alive, keep_alive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                biased;
                _ = signal.cancelled() => Step::Cancelled,
                item = events.next() => Step::Event(item),
                _ = ticker.tick() => Step::KeepAlive,
            };
            match step {
                Step::Event(Some(Ok(value))) => yield Ok(data_frame(&value)),
                Step::Event(Some(Err(failure))) => {
                    error!(route = %disconnect.route, error = %failure, "Error in {}.", disconnect.route);
                    yield Ok(error_frame(failure));
                    break;
                }
                Step::Event(None) | Step::Cancelled => break,
                Step::KeepAlive => yield Ok(Bytes::from_static(KEEP_ALIVE_FRAME)),
            }
        }
        disconnect.finish();
    }
}

/// Streaming response carrying `frames`.
pub(crate) fn response<S>(frames: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut response = Response::new(Body::from_stream(frames));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache,no-transform"));
    headers.insert(HeaderName::from_static("x-no-compression"), HeaderValue::from_static("1"));
    response
}
