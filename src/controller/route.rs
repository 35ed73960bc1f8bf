//! Route descriptors, handler signatures and the stage-typed route builder.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use axum::http::Method;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cancellation::CancellationToken;
use crate::context::{Reply, RequestContext};
use crate::error::{ModularError, ModularResult, RegistryKind};
use crate::provider::ServiceContainer;
use crate::route_error::{GenericRouteError, RouteFailure};
use crate::worker::{QueueContainer, WorkerContainer};

use super::Controller;

/// Route methods. `Sse` is served as `GET` with a streaming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Sse,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Sse => "SSE",
        }
    }

    /// Whether requests may carry a body.
    pub fn accepts_body(&self) -> bool {
        matches!(
            self,
            HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete
        )
    }

    /// Method on the wire.
    pub fn wire_method(&self) -> Method {
        match self {
            HttpMethod::Get | HttpMethod::Sse => Method::GET,
            HttpMethod::Head => Method::HEAD,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validator for one part of a request or response.
///
/// Validation itself is up to the implementation; closures of type
/// `Fn(&Value) -> Result<(), Vec<String>>` qualify directly.
pub trait Schema: Send + Sync + 'static {
    /// Returns the list of violations when `value` does not conform.
    fn validate(&self, value: &Value) -> Result<(), Vec<String>>;

    /// Machine-readable description, listed in the route manifest.
    fn describe(&self) -> Value {
        json!({})
    }
}

impl<F> Schema for F
where
    F: Fn(&Value) -> Result<(), Vec<String>> + Send + Sync + 'static,
{
    fn validate(&self, value: &Value) -> Result<(), Vec<String>> {
        self(value)
    }
}

/// A validator paired with its description.
pub struct Described<F> {
    description: Value,
    validate: F,
}

/// Wraps `validate` so the manifest shows `description`.
pub fn described<F>(description: Value, validate: F) -> Described<F>
where
    F: Fn(&Value) -> Result<(), Vec<String>> + Send + Sync + 'static,
{
    Described { description, validate }
}

impl<F> Schema for Described<F>
where
    F: Fn(&Value) -> Result<(), Vec<String>> + Send + Sync + 'static,
{
    fn validate(&self, value: &Value) -> Result<(), Vec<String>> {
        (self.validate)(value)
    }

    fn describe(&self) -> Value {
        self.description.clone()
    }
}

/// Schemas attached to a route.
#[derive(Clone, Default)]
pub struct RouteSchemas {
    pub body: Option<Arc<dyn Schema>>,
    pub output: Option<Arc<dyn Schema>>,
    pub querystring: Option<Arc<dyn Schema>>,
    pub params: Option<Arc<dyn Schema>>,
    pub headers: Option<Arc<dyn Schema>>,
}

impl std::fmt::Debug for RouteSchemas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSchemas")
            .field("body", &self.body.is_some())
            .field("output", &self.output.is_some())
            .field("querystring", &self.querystring.is_some())
            .field("params", &self.params.is_some())
            .field("headers", &self.headers.is_some())
            .finish()
    }
}

/// Per-route settings passed through to the binding layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteOptions {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub deprecated: bool,
    /// Extra manifest tags, after the controller tag
    pub tags: Vec<String>,
    /// Overrides the server body limit for this route, in bytes
    pub body_limit: Option<usize>,
}

/// Everything a handler is called with.
pub struct HandlerOpts<C> {
    /// Final middleware context
    pub ctx: C,
    pub services: ServiceContainer,
    pub workers: WorkerContainer,
    pub queues: QueueContainer,
    pub request: RequestContext,
    /// Parsed JSON body, `null` when absent
    pub body: Value,
    /// Path parameters as a JSON object of strings
    pub params: Value,
    /// Query string as a JSON object of strings
    pub querystring: Value,
    /// Request headers as a JSON object of strings
    pub headers: Value,
    /// Cancelled when the client goes away
    pub signal: CancellationToken,
}

fn typed<T: DeserializeOwned>(part: &str, value: &Value) -> Result<T, GenericRouteError> {
    T::deserialize(value).map_err(|err| {
        GenericRouteError::bad_request(format!("Invalid {part}.")).with_payload(json!({ part: [err.to_string()] }))
    })
}

impl<C> HandlerOpts<C> {
    /// Deserializes the body; `BAD_REQUEST` on mismatch.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, GenericRouteError> {
        typed("body", &self.body)
    }

    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, GenericRouteError> {
        typed("params", &self.params)
    }

    pub fn query_as<T: DeserializeOwned>(&self) -> Result<T, GenericRouteError> {
        typed("querystring", &self.querystring)
    }

    pub fn headers_as<T: DeserializeOwned>(&self) -> Result<T, GenericRouteError> {
        typed("headers", &self.headers)
    }

    /// Response status and headers for this request.
    pub fn reply(&self) -> &Reply {
        self.request.reply()
    }
}

pub(crate) type JsonHandler<C> =
    Arc<dyn Fn(HandlerOpts<C>) -> BoxFuture<'static, Result<Value, RouteFailure>> + Send + Sync>;

pub(crate) type SseHandler<C> =
    Arc<dyn Fn(HandlerOpts<C>) -> BoxStream<'static, Result<Value, RouteFailure>> + Send + Sync>;

/// Request/response handler or event producer.
pub enum RouteHandler<C> {
    Json(JsonHandler<C>),
    Sse(SseHandler<C>),
}

impl<C> Clone for RouteHandler<C> {
    fn clone(&self) -> Self {
        match self {
            RouteHandler::Json(handler) => RouteHandler::Json(Arc::clone(handler)),
            RouteHandler::Sse(handler) => RouteHandler::Sse(Arc::clone(handler)),
        }
    }
}

/// One declared route.
pub struct RouteDescriptor<C> {
    pub(crate) method: HttpMethod,
    pub(crate) path: String,
    pub(crate) schemas: RouteSchemas,
    pub(crate) options: RouteOptions,
    pub(crate) handler: RouteHandler<C>,
}

impl<C> Clone for RouteDescriptor<C> {
    fn clone(&self) -> Self {
        Self {
            method: self.method,
            path: self.path.clone(),
            schemas: self.schemas.clone(),
            options: self.options.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<C> RouteDescriptor<C> {
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Path relative to the controller root.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn schemas(&self) -> &RouteSchemas {
        &self.schemas
    }

    pub fn options(&self) -> &RouteOptions {
        &self.options
    }

    pub fn is_sse(&self) -> bool {
        matches!(self.handler, RouteHandler::Sse(_))
    }
}

impl<C> std::fmt::Debug for RouteDescriptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDescriptor")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("schemas", &self.schemas)
            .field("options", &self.options)
            .finish()
    }
}

/// Stage marker: the route may still declare a body schema.
pub struct OpenBody;
/// Stage marker: no body schema (bodiless method, or already declared).
pub struct NoBody;
/// Stage marker: server-sent events route.
pub struct EventStream;

/// Route under construction; finished by `handler`.
///
/// ```rust
/// use ferrous_modular::controller::ControllerBuilder;
/// use serde_json::{json, Value};
///
/// # fn build() -> Result<(), ferrous_modular::ModularError> {
/// let mut users = ControllerBuilder::<Value>::new().root_path("/users");
/// users
///     .post("/")?
///     .body(|value: &Value| if value.is_object() { Ok(()) } else { Err(vec!["expected object".to_string()]) })
///     .handler(|opts| async move { Ok(json!({ "created": opts.body })) });
/// users.get("/:id")?.handler(|opts| async move { Ok(opts.params) });
///
/// assert!(users.post("/").is_err());
/// assert_eq!(users.finish().routes().len(), 2);
/// # Ok(())
/// # }
/// ```
pub struct RouteBuilder<'a, C, S> {
    controller: &'a mut Controller<C>,
    method: HttpMethod,
    path: String,
    schemas: RouteSchemas,
    options: RouteOptions,
    _stage: PhantomData<S>,
}

impl<'a, C, S> RouteBuilder<'a, C, S> {
    pub(crate) fn new(controller: &'a mut Controller<C>, method: HttpMethod, path: String) -> Self {
        Self {
            controller,
            method,
            path,
            schemas: RouteSchemas::default(),
            options: RouteOptions::default(),
            _stage: PhantomData,
        }
    }

    fn restage<T>(self) -> RouteBuilder<'a, C, T> {
        RouteBuilder {
            controller: self.controller,
            method: self.method,
            path: self.path,
            schemas: self.schemas,
            options: self.options,
            _stage: PhantomData,
        }
    }

    /// Response schema. Successful JSON responses are checked against it.
    pub fn output(mut self, schema: impl Schema) -> Self {
        self.schemas.output = Some(Arc::new(schema));
        self
    }

    pub fn querystring(mut self, schema: impl Schema) -> Self {
        self.schemas.querystring = Some(Arc::new(schema));
        self
    }

    pub fn params(mut self, schema: impl Schema) -> Self {
        self.schemas.params = Some(Arc::new(schema));
        self
    }

    pub fn headers(mut self, schema: impl Schema) -> Self {
        self.schemas.headers = Some(Arc::new(schema));
        self
    }

    pub fn options(mut self, options: RouteOptions) -> Self {
        self.options = options;
        self
    }

    fn install(self, handler: RouteHandler<C>) -> &'a mut Controller<C> {
        let RouteBuilder {
            controller,
            method,
            path,
            schemas,
            options,
            ..
        } = self;
        controller.routes.push(RouteDescriptor {
            method,
            path,
            schemas,
            options,
            handler,
        });
        controller
    }
}

fn json_handler<C, R, F, Fut>(handler: F) -> RouteHandler<C>
where
    C: Send + 'static,
    R: Serialize,
    F: Fn(HandlerOpts<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, RouteFailure>> + Send + 'static,
{
    RouteHandler::Json(Arc::new(move |opts: HandlerOpts<C>| {
        handler(opts)
            .map(|result| result.and_then(|value| serde_json::to_value(value).map_err(RouteFailure::from)))
            .boxed()
    }))
}

impl<'a, C: Send + 'static> RouteBuilder<'a, C, OpenBody> {
    /// Request body schema.
    pub fn body(mut self, schema: impl Schema) -> RouteBuilder<'a, C, NoBody> {
        self.schemas.body = Some(Arc::new(schema));
        self.restage()
    }

    /// Finishes the route. A handler returning `()`, `None` or JSON `null`
    /// produces `204 No Content`.
    pub fn handler<R, F, Fut>(self, handler: F) -> &'a mut Controller<C>
    where
        R: Serialize,
        F: Fn(HandlerOpts<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RouteFailure>> + Send + 'static,
    {
        self.install(json_handler(handler))
    }
}

impl<'a, C: Send + 'static> RouteBuilder<'a, C, NoBody> {
    /// Finishes the route. A handler returning `()`, `None` or JSON `null`
    /// produces `204 No Content`.
    pub fn handler<R, F, Fut>(self, handler: F) -> &'a mut Controller<C>
    where
        R: Serialize,
        F: Fn(HandlerOpts<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RouteFailure>> + Send + 'static,
    {
        self.install(json_handler(handler))
    }
}

impl<'a, C: Send + 'static> RouteBuilder<'a, C, EventStream> {
    /// Finishes the route with an event producer, called once per request.
    /// Every item becomes one `data:` frame; an `Err` item ends the stream
    /// with an `error:` frame.
    pub fn handler<T, F, St>(self, producer: F) -> &'a mut Controller<C>
    where
        T: Serialize + Send + 'static,
        F: Fn(HandlerOpts<C>) -> St + Send + Sync + 'static,
        St: Stream<Item = Result<T, RouteFailure>> + Send + 'static,
    {
        let erased: SseHandler<C> = Arc::new(move |opts: HandlerOpts<C>| {
            producer(opts)
                .and_then(|item| async move { serde_json::to_value(item).map_err(RouteFailure::from) })
                .boxed()
        });
        self.install(RouteHandler::Sse(erased))
    }
}

impl<C: Send + 'static> Controller<C> {
    fn declare<S>(&mut self, method: HttpMethod, path: &str) -> ModularResult<RouteBuilder<'_, C, S>> {
        if !path.starts_with('/') {
            return Err(ModularError::InvalidPath(path.to_string()));
        }
        if self
            .routes
            .iter()
            .any(|route| route.method == method && route.path == path)
        {
            return Err(ModularError::duplicate(
                RegistryKind::Route,
                format!("{method} {}{path}", self.root_path),
            ));
        }
        Ok(RouteBuilder::new(self, method, path.to_string()))
    }

    /// Declares a route with a method chosen at runtime.
    ///
    /// Body schemas can only be attached through the typed shortcuts
    /// ([`post`](Self::post), [`put`](Self::put), [`patch`](Self::patch),
    /// [`delete`](Self::delete)); SSE routes go through [`sse`](Self::sse).
    ///
    /// # Errors
    ///
    /// `DuplicateRegistration` if `(method, path)` is already declared,
    /// `InvalidPath` if `path` does not start with `/`, and `InvalidPath` for
    /// `HttpMethod::Sse`.
    pub fn add_route(&mut self, method: HttpMethod, path: &str) -> ModularResult<RouteBuilder<'_, C, NoBody>> {
        if method == HttpMethod::Sse {
            return Err(ModularError::InvalidPath(format!("SSE {path}")));
        }
        self.declare(method, path)
    }

    pub fn get(&mut self, path: &str) -> ModularResult<RouteBuilder<'_, C, NoBody>> {
        self.declare(HttpMethod::Get, path)
    }

    pub fn head(&mut self, path: &str) -> ModularResult<RouteBuilder<'_, C, NoBody>> {
        self.declare(HttpMethod::Head, path)
    }

    pub fn post(&mut self, path: &str) -> ModularResult<RouteBuilder<'_, C, OpenBody>> {
        self.declare(HttpMethod::Post, path)
    }

    pub fn put(&mut self, path: &str) -> ModularResult<RouteBuilder<'_, C, OpenBody>> {
        self.declare(HttpMethod::Put, path)
    }

    pub fn patch(&mut self, path: &str) -> ModularResult<RouteBuilder<'_, C, OpenBody>> {
        self.declare(HttpMethod::Patch, path)
    }

    pub fn delete(&mut self, path: &str) -> ModularResult<RouteBuilder<'_, C, OpenBody>> {
        self.declare(HttpMethod::Delete, path)
    }

    /// Declares a server-sent events route, served as `GET`.
    pub fn sse(&mut self, path: &str) -> ModularResult<RouteBuilder<'_, C, EventStream>> {
        self.declare(HttpMethod::Sse, path)
    }
}
