//! Route-level errors and their HTTP rendering.
//!
//! Handlers and middleware return [`RouteFailure`]. A [`GenericRouteError`]
//! raised on purpose keeps its status, message and payload; anything else is
//! reported as `INTERNAL_ERROR` with the error chain in `internal.stack`.
//!
//! ```rust
//! use ferrous_modular::{ErrorStatus, GenericRouteError, RouteFailure};
//!
//! fn find(id: u32) -> Result<String, RouteFailure> {
//!     if id == 0 {
//!         return Err(GenericRouteError::not_found("No such user.").into());
//!     }
//!     let parsed: u32 = "x".parse()?;
//!     Ok(parsed.to_string())
//! }
//!
//! let err = find(0).unwrap_err().into_route_error();
//! assert_eq!(err.status(), ErrorStatus::NotFound);
//!
//! let err = find(1).unwrap_err().into_route_error();
//! assert_eq!(err.status(), ErrorStatus::InternalError);
//! assert!(err.stack().is_some());
//! ```

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Status carried in the error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStatus {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    InternalError,
}

impl ErrorStatus {
    /// HTTP status code for this status.
    pub fn code(&self) -> StatusCode {
        match self {
            ErrorStatus::BadRequest => StatusCode::BAD_REQUEST,
            ErrorStatus::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorStatus::Forbidden => StatusCode::FORBIDDEN,
            ErrorStatus::NotFound => StatusCode::NOT_FOUND,
            ErrorStatus::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorStatus::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStatus::BadRequest => "BAD_REQUEST",
            ErrorStatus::Unauthorized => "UNAUTHORIZED",
            ErrorStatus::Forbidden => "FORBIDDEN",
            ErrorStatus::NotFound => "NOT_FOUND",
            ErrorStatus::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorStatus::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error responses every route may produce, with their descriptions.
pub const ERROR_RESPONSES: [(u16, &str); 5] = [
    (400, "Bad request, input malformed."),
    (401, "Unauthorized"),
    (403, "Forbidden"),
    (405, "Method not allowed"),
    (500, "Internal server error"),
];

/// JSON schema of the error body.
pub fn error_body_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "description": description,
        "required": ["status", "message", "internal"],
        "properties": {
            "status": { "type": "string" },
            "message": { "type": "string" },
            "payload": {},
            "internal": {
                "type": "object",
                "properties": {
                    "stack": { "type": "string" },
                    "cause": { "type": "string" }
                }
            }
        }
    })
}

/// An error with an explicit status, raised intentionally by route code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{status}: {message}")]
pub struct GenericRouteError {
    status: ErrorStatus,
    message: String,
    payload: Option<Value>,
    stack: Option<String>,
}

impl GenericRouteError {
    pub fn new(status: ErrorStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            payload: None,
            stack: None,
        }
    }

    /// Wraps another error, keeping its rendering (chain and backtrace) as the stack.
    pub fn from_error(error: impl Into<anyhow::Error>, status: ErrorStatus, message: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            stack: Some(format!("{error:?}")),
            ..Self::new(status, message)
        }
    }

    /// Attaches a payload. Values that fail to serialize are dropped.
    pub fn with_payload(mut self, payload: impl Serialize) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorStatus::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorStatus::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorStatus::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorStatus::NotFound, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorStatus::MethodNotAllowed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorStatus::InternalError, message)
    }

    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    /// HTTP status code.
    pub fn code(&self) -> StatusCode {
        self.status.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// `{status, message, payload?, internal: {stack?}}`
    pub fn to_json(&self) -> Value {
        let mut internal = serde_json::Map::new();
        if let Some(stack) = &self.stack {
            internal.insert("stack".into(), Value::String(stack.clone()));
        }
        let mut body = serde_json::Map::new();
        body.insert("status".into(), Value::String(self.status.as_str().into()));
        body.insert("message".into(), Value::String(self.message.clone()));
        if let Some(payload) = &self.payload {
            body.insert("payload".into(), payload.clone());
        }
        body.insert("internal".into(), Value::Object(internal));
        Value::Object(body)
    }
}

impl IntoResponse for GenericRouteError {
    fn into_response(self) -> Response {
        (self.code(), Json(self.to_json())).into_response()
    }
}

/// Error returned by route handlers and middleware.
///
/// Deliberately not a `std::error::Error`, so that every error type can be
/// converted into it with `?`.
#[derive(Debug)]
pub enum RouteFailure {
    /// Intentional error, sent as is
    Route(GenericRouteError),
    /// Anything else, sent as `INTERNAL_ERROR`
    Internal(anyhow::Error),
}

impl RouteFailure {
    /// The error body that will be sent for this failure.
    pub fn into_route_error(self) -> GenericRouteError {
        match self {
            RouteFailure::Route(error) => error,
            RouteFailure::Internal(error) => {
                GenericRouteError::from_error(error, ErrorStatus::InternalError, "Unknown internal error.")
            }
        }
    }

    /// Status the failure maps to.
    pub fn status(&self) -> ErrorStatus {
        match self {
            RouteFailure::Route(error) => error.status(),
            RouteFailure::Internal(_) => ErrorStatus::InternalError,
        }
    }
}

impl<E> From<E> for RouteFailure
where
    E: Into<anyhow::Error>,
{
    fn from(error: E) -> Self {
        match error.into().downcast::<GenericRouteError>() {
            Ok(route) => RouteFailure::Route(route),
            Err(other) => RouteFailure::Internal(other),
        }
    }
}

impl fmt::Display for RouteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteFailure::Route(error) => fmt::Display::fmt(error, f),
            RouteFailure::Internal(error) => write!(f, "{error:#}"),
        }
    }
}

impl IntoResponse for RouteFailure {
    fn into_response(self) -> Response {
        self.into_route_error().into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModularError;

    #[test]
    fn statuses_map_to_http_codes() {
        assert_eq!(ErrorStatus::BadRequest.code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorStatus::MethodNotAllowed.code().as_u16(), 405);
        assert_eq!(ErrorStatus::InternalError.code().as_u16(), 500);
        assert_eq!(serde_json::to_value(ErrorStatus::NotFound).unwrap(), json!("NOT_FOUND"));
    }

    #[test]
    fn body_omits_missing_payload() {
        let body = GenericRouteError::forbidden("nope").to_json();
        assert_eq!(
            body,
            json!({ "status": "FORBIDDEN", "message": "nope", "internal": {} })
        );
    }

    #[test]
    fn body_carries_payload() {
        let body = GenericRouteError::bad_request("invalid")
            .with_payload(json!({ "field": "email" }))
            .to_json();
        assert_eq!(body["payload"]["field"], "email");
    }

    #[test]
    fn generic_errors_survive_question_mark() {
        fn handler() -> Result<(), RouteFailure> {
            let checked: Result<(), GenericRouteError> = Err(GenericRouteError::unauthorized("login first"));
            checked?;
            Ok(())
        }
        let failure = handler().unwrap_err();
        assert!(matches!(failure, RouteFailure::Route(ref e) if e.status() == ErrorStatus::Unauthorized));
    }

    #[test]
    fn framework_errors_become_internal() {
        let failure = RouteFailure::from(ModularError::UnknownService("db".into()));
        assert_eq!(failure.status(), ErrorStatus::InternalError);

        let error = failure.into_route_error();
        assert_eq!(error.message(), "Unknown internal error.");
        assert!(error.stack().unwrap().contains("No service named \"db\" found!"));
    }

    #[test]
    fn from_error_keeps_source_rendering() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let error = GenericRouteError::from_error(io, ErrorStatus::InternalError, "Upload failed.");
        assert_eq!(error.message(), "Upload failed.");
        assert!(error.stack().unwrap().contains("disk full"));
    }
}
