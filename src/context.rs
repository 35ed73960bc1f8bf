//! Per-request context handed to request scoped factories, middleware and handlers.
//!
//! There is no ambient storage: the binding layer builds one [`RequestContext`]
//! per incoming request and passes it down explicitly. Request scoped service
//! factories are the only factories that receive it.

use std::sync::Arc;

use axum::http::{header::HeaderName, request::Parts, HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use axum::response::Response;
use parking_lot::Mutex;

/// Immutable view of the incoming request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// HTTP method as received (SSE routes arrive as `GET`)
    pub method: Method,
    /// Full request URI
    pub uri: Uri,
    /// Protocol version
    pub version: Version,
    /// Request headers
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Copies the request line and headers out of axum request parts.
    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
        }
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Default)]
struct ReplyState {
    status: Option<StatusCode>,
    headers: HeaderMap,
}

/// Handle for shaping the successful response of the current request.
///
/// Middleware and handlers share the same handle. The status and headers set
/// here are applied to ordinary (non-streaming) success responses; error
/// responses always carry the status of the error.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    state: Arc<Mutex<ReplyState>>,
}

impl Reply {
    /// Creates an empty reply handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the success status code.
    pub fn set_status(&self, status: StatusCode) {
        self.state.lock().status = Some(status);
    }

    /// The status override, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.state.lock().status
    }

    /// Adds or replaces a response header.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.state.lock().headers.insert(name, value);
    }

    /// Snapshot of the headers set so far.
    pub fn headers(&self) -> HeaderMap {
        self.state.lock().headers.clone()
    }

    pub(crate) fn apply(&self, response: &mut Response) {
        let state = self.state.lock();
        if let Some(status) = state.status {
            *response.status_mut() = status;
        }
        for (name, value) in state.headers.iter() {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
}

/// The request/reply pair of one incoming request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    head: Arc<RequestHead>,
    reply: Reply,
}

impl RequestContext {
    /// Creates a context from a request head and a reply handle.
    pub fn new(head: RequestHead, reply: Reply) -> Self {
        Self { head: Arc::new(head), reply }
    }

    /// The incoming request.
    pub fn request(&self) -> &RequestHead {
        &self.head
    }

    /// The reply handle.
    pub fn reply(&self) -> &Reply {
        &self.reply
    }
}
