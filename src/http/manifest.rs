//! Listing of every bound route with its schemas and response table.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::controller::{HttpMethod, RouteOptions, RouteSchemas};
use crate::route_error::{error_body_schema, ERROR_RESPONSES};

/// One documented response of a route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEntry {
    pub description: String,
    /// Empty for responses without a body
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// A bound route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteEntry {
    pub method: HttpMethod,
    pub path: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub deprecated: bool,
    /// Request schemas by part (`body`, `params`, `querystring`, `headers`)
    pub schemas: BTreeMap<String, Value>,
    pub responses: BTreeMap<u16, ResponseEntry>,
}

impl RouteEntry {
    pub(crate) fn new(
        method: HttpMethod,
        path: String,
        root: &str,
        schemas: &RouteSchemas,
        options: &RouteOptions,
    ) -> Self {
        let mut tags = vec![root.trim_start_matches('/').to_string()];
        tags.extend(options.tags.iter().cloned());

        let mut requests = BTreeMap::new();
        let parts = [
            ("body", &schemas.body),
            ("params", &schemas.params),
            ("querystring", &schemas.querystring),
            ("headers", &schemas.headers),
        ];
        for (part, schema) in parts {
            if let Some(schema) = schema {
                requests.insert(part.to_string(), schema.describe());
            }
        }

        let output = schemas.output.as_ref().map(|schema| schema.describe());
        let mut responses = BTreeMap::new();
        match (method, output) {
            (HttpMethod::Sse, schema) => {
                responses.insert(
                    200,
                    ResponseEntry {
                        description: "Event stream".to_string(),
                        content_type: "text/event-stream".to_string(),
                        schema,
                    },
                );
            }
            (_, Some(schema)) => {
                responses.insert(
                    200,
                    ResponseEntry {
                        description: "Successful response".to_string(),
                        content_type: "application/json".to_string(),
                        schema: Some(schema),
                    },
                );
            }
            (_, None) => {
                responses.insert(
                    204,
                    ResponseEntry {
                        description: "No content".to_string(),
                        content_type: String::new(),
                        schema: None,
                    },
                );
            }
        }
        for (code, description) in ERROR_RESPONSES {
            responses.insert(
                code,
                ResponseEntry {
                    description: description.to_string(),
                    content_type: "application/json".to_string(),
                    schema: Some(error_body_schema(description)),
                },
            );
        }

        Self {
            method,
            path,
            tags,
            summary: options.summary.clone(),
            description: options.description.clone(),
            deprecated: options.deprecated,
            schemas: requests,
            responses,
        }
    }
}

/// Every route the application serves, in bind order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouteManifest {
    routes: Vec<RouteEntry>,
}

impl RouteManifest {
    pub(crate) fn push(&mut self, entry: RouteEntry) {
        self.routes.push(entry);
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn find(&self, method: HttpMethod, path: &str) -> Option<&RouteEntry> {
        self.routes.iter().find(|r| r.method == method && r.path == path)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
