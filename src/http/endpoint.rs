//! The per-request pipeline behind every bound route.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::context::{Reply, RequestContext, RequestHead};
use crate::controller::{HandlerOpts, HttpMethod, RouteDescriptor, RouteHandler};
use crate::middleware::Chain;
use crate::registration::ServiceRegistry;
use crate::route_error::{ErrorStatus, GenericRouteError, RouteFailure};

use super::sse::{self, DISCONNECT_REASON};

pub(crate) struct Endpoint<C> {
    pub(crate) path: String,
    pub(crate) route: RouteDescriptor<C>,
    pub(crate) chain: Chain<C>,
    pub(crate) services: ServiceRegistry,
    pub(crate) body_limit: usize,
    pub(crate) keep_alive: Duration,
}

fn strings(map: HashMap<String, String>) -> Value {
    Value::Object(map.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
}

fn header_values(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        match out.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            _ => {
                out.insert(name.as_str().to_string(), Value::String(value.to_string()));
            }
        }
    }
    Value::Object(out)
}

impl<C> Endpoint<C>
where
    C: Clone + Default + Send + Sync + 'static,
{
    fn method(&self) -> HttpMethod {
        self.route.method
    }

    pub(crate) async fn serve(
        &self,
        params: HashMap<String, String>,
        query: HashMap<String, String>,
        request: Request,
    ) -> Response {
        let span = info_span!(
            "request",
            route = %self.path,
            method = %self.method(),
            request_id = %Uuid::new_v4(),
        );
        async move {
            match self.respond(params, query, request).await {
                Ok(response) => response,
                Err(failure) => {
                    error!(route = %self.path, method = %self.method(), error = %failure, "Error in {}.", self.path);
                    failure.into_response()
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn respond(
        &self,
        params: HashMap<String, String>,
        query: HashMap<String, String>,
        request: Request,
    ) -> Result<Response, RouteFailure> {
        let (parts, body) = request.into_parts();
        let request = RequestContext::new(RequestHead::from_parts(&parts), Reply::new());

        let body = self.read_body(body).await?;
        let params = strings(params);
        let querystring = strings(query);
        let headers = header_values(&parts.headers);
        self.validate_input(&body, &params, &querystring, &headers)?;

        let deps = self.services.resolve_for_request(request.clone()).deps();
        let ctx = self
            .chain
            .run(C::default(), deps.clone(), request.clone())
            .await?;

        let signal = CancellationToken::new();
        let opts = HandlerOpts {
            ctx,
            services: deps.services,
            workers: deps.workers,
            queues: deps.queues,
            request: request.clone(),
            body,
            params,
            querystring,
            headers,
            signal: signal.clone(),
        };

        match &self.route.handler {
            RouteHandler::Json(handler) => {
                let guard = signal.drop_guard(DISCONNECT_REASON);
                let value = handler(opts).await?;
                guard.disarm();
                self.check_output(&value)?;

                let mut response = if value.is_null() {
                    StatusCode::NO_CONTENT.into_response()
                } else {
                    Json(value).into_response()
                };
                request.reply().apply(&mut response);
                Ok(response)
            }
            RouteHandler::Sse(producer) => {
                debug!(route = %self.path, "opening event stream");
                let events = producer(opts);
                Ok(sse::response(sse::frames(events, signal, self.keep_alive, self.path.clone())))
            }
        }
    }

    async fn read_body(&self, body: Body) -> Result<Value, RouteFailure> {
        if !self.method().accepts_body() {
            return Ok(Value::Null);
        }
        let bytes = axum::body::to_bytes(body, self.body_limit).await.map_err(|err| {
            GenericRouteError::from_error(err, ErrorStatus::BadRequest, "Request body too large or unreadable.")
        })?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        let value = serde_json::from_slice(&bytes).map_err(|err| {
            GenericRouteError::bad_request("Body is not valid JSON.").with_payload(json!({ "body": [err.to_string()] }))
        })?;
        Ok(value)
    }

    fn validate_input(
        &self,
        body: &Value,
        params: &Value,
        querystring: &Value,
        headers: &Value,
    ) -> Result<(), GenericRouteError> {
        let schemas = &self.route.schemas;
        let parts = [
            ("body", &schemas.body, body),
            ("params", &schemas.params, params),
            ("querystring", &schemas.querystring, querystring),
            ("headers", &schemas.headers, headers),
        ];

        let mut violations = Map::new();
        for (part, schema, value) in parts {
            let Some(schema) = schema else { continue };
            if let Err(found) = schema.validate(value) {
                violations.insert(part.to_string(), json!(found));
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(GenericRouteError::bad_request("Request validation failed.").with_payload(Value::Object(violations)))
        }
    }

    fn check_output(&self, value: &Value) -> Result<(), GenericRouteError> {
        match &self.route.schemas.output {
            Some(schema) if !value.is_null() => schema.validate(value).map_err(|found| {
                GenericRouteError::internal("Response validation failed.").with_payload(json!({ "output": found }))
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.insert("x-tenant", HeaderValue::from_static("acme"));

        let value = header_values(&headers);
        assert_eq!(value["accept"], "text/html, application/json");
        assert_eq!(value["x-tenant"], "acme");
    }

    #[test]
    fn string_maps_become_objects() {
        let mut map = HashMap::new();
        map.insert("id".to_string(), "7".to_string());
        assert_eq!(strings(map), json!({ "id": "7" }));
        assert_eq!(strings(HashMap::new()), json!({}));
    }
}
