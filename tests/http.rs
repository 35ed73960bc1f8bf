use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use ferrous_modular::controller::{ControllerBuilder, ControllerRegistry, RouteOptions};
use ferrous_modular::middleware::{middleware, MiddlewareArgs, Next};
use ferrous_modular::{
    define_request, define_singleton, BoxError, BoundApp, GenericRouteError, HttpMethod, ModularApp, ModularConfig,
    RequestContext, RouteFailure, ServiceRegistry,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn bind(services: ServiceRegistry, controllers: ControllerRegistry) -> BoundApp {
    init_tracing();
    ModularApp::new(services, controllers).build().await.unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

async fn get(router: &Router, uri: &str) -> Response {
    send(router, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ===== Responses =====

#[tokio::test]
async fn test_get_returns_json() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/test");
    controller
        .get("/")
        .unwrap()
        .handler(|_| async { Ok(json!({ "test": "succeeded" })) });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    let response = get(&app.router, "/test").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "test": "succeeded" }));
}

#[tokio::test]
async fn test_plain_errors_become_internal_errors() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/boom");
    controller.get("/").unwrap().handler(|_| async {
        let failed: Result<Value, std::io::Error> = Err(std::io::Error::new(std::io::ErrorKind::Other, "kaboom"));
        Ok::<Value, RouteFailure>(failed?)
    });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    let response = get(&app.router, "/boom").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["status"], "INTERNAL_ERROR");
    assert_eq!(body["message"], "Unknown internal error.");
    assert!(body["internal"]["stack"].as_str().unwrap().contains("kaboom"));
    assert!(body.get("payload").is_none());
}

#[tokio::test]
async fn test_route_errors_pass_through() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/secret");
    controller.get("/").unwrap().handler(|_| async {
        Err::<Value, RouteFailure>(
            GenericRouteError::unauthorized("Login required.")
                .with_payload(json!({ "realm": "admin" }))
                .into(),
        )
    });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    let response = get(&app.router, "/secret").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        json_body(response).await,
        json!({
            "status": "UNAUTHORIZED",
            "message": "Login required.",
            "payload": { "realm": "admin" },
            "internal": {}
        })
    );
}

#[tokio::test]
async fn test_empty_results_are_no_content() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/items");
    controller.delete("/:id").unwrap().handler(|_| async { Ok(()) });
    controller
        .get("/none")
        .unwrap()
        .handler(|_| async { Ok(None::<String>) });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    let response = send(&app.router, Request::delete("/items/7").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(to_bytes(response.into_body(), usize::MAX).await.unwrap().is_empty());

    assert_eq!(get(&app.router, "/items/none").await.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_reply_sets_status_and_headers() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/things");
    controller.post("/").unwrap().handler(|opts| async move {
        opts.reply().set_status(StatusCode::CREATED);
        opts.reply()
            .insert_header(header::LOCATION, HeaderValue::from_static("/things/1"));
        Ok(json!({ "id": 1 }))
    });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    let response = send(&app.router, post_json("/things", "{}")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()[header::LOCATION], "/things/1");
}

#[tokio::test]
async fn test_unmatched_routes_are_json_not_found() {
    let app = bind(ServiceRegistry::new(), ControllerRegistry::new()).await;
    let response = get(&app.router, "/nowhere").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["status"], "NOT_FOUND");
    assert_eq!(body["message"], "Route GET:/nowhere not found");
}

// ===== Input =====

#[derive(Deserialize)]
struct Page {
    page: String,
}

#[tokio::test]
async fn test_params_query_and_headers_reach_the_handler() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/users");
    controller.get("/:id").unwrap().handler(|opts| async move {
        let page: Page = opts.query_as()?;
        Ok(json!({
            "id": opts.params["id"],
            "page": page.page,
            "tenant": opts.headers["x-tenant"],
        }))
    });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    let request = Request::get("/users/42?page=3")
        .header("x-tenant", "acme")
        .body(Body::empty())
        .unwrap();
    let body = json_body(send(&app.router, request).await).await;
    assert_eq!(body, json!({ "id": "42", "page": "3", "tenant": "acme" }));

    let response = get(&app.router, "/users/42").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["payload"]["querystring"].is_array());
}

fn requires_name(value: &Value) -> Result<(), Vec<String>> {
    match value.get("name") {
        Some(Value::String(_)) => Ok(()),
        _ => Err(vec!["name must be a string".to_string()]),
    }
}

#[tokio::test]
async fn test_body_schema_rejects_invalid_input() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/people");
    controller
        .post("/")
        .unwrap()
        .body(requires_name)
        .handler(|opts| async move { Ok(opts.body) });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    let ok = send(&app.router, post_json("/people", r#"{"name":"ada"}"#)).await;
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(json_body(ok).await, json!({ "name": "ada" }));

    let invalid = send(&app.router, post_json("/people", r#"{"name":1}"#)).await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    let body = json_body(invalid).await;
    assert_eq!(body["status"], "BAD_REQUEST");
    assert_eq!(body["payload"]["body"], json!(["name must be a string"]));

    let malformed = send(&app.router, post_json("/people", "{not json")).await;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(malformed).await["message"], "Body is not valid JSON.");
}

#[tokio::test]
async fn test_body_limit_is_enforced_per_route() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/small");
    controller
        .post("/")
        .unwrap()
        .options(RouteOptions {
            body_limit: Some(8),
            ..RouteOptions::default()
        })
        .handler(|opts| async move { Ok(opts.body) });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    assert_eq!(send(&app.router, post_json("/small", "[1]")).await.status(), StatusCode::OK);
    let response = send(&app.router, post_json("/small", r#"{"too":"large"}"#)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_output_schema_violations_are_internal_errors() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/out");
    controller
        .get("/")
        .unwrap()
        .output(requires_name)
        .handler(|_| async { Ok(json!({ "nom": "x" })) });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    let response = get(&app.router, "/out").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["message"], "Response validation failed.");
}

// ===== Middleware and services =====

#[derive(Clone, Default)]
struct Auth {
    user: Option<String>,
}

#[tokio::test]
async fn test_middleware_context_and_session_reach_the_handler() {
    let services = ServiceRegistry::new();
    let built = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&built);
    services
        .register(define_request("caller", move |_, request: RequestContext| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(request.request().header("x-user").unwrap_or("anonymous").to_string())
            }
        }))
        .unwrap();

    let mut controller = ControllerBuilder::<Auth>::new()
        .use_middleware(middleware(|args: MiddlewareArgs<Auth>, next: Next<Auth>| async move {
            let caller = args.services.get::<String>("caller").await?;
            if caller.as_str() == "anonymous" {
                return Err(GenericRouteError::forbidden("Who are you?").into());
            }
            next.run(Auth {
                user: Some(caller.to_string()),
            })
            .await
        }))
        .root_path("/me");
    controller.get("/").unwrap().handler(|opts| async move {
        let caller = opts.services.get::<String>("caller").await?;
        Ok(json!({ "ctx": opts.ctx.user, "service": caller.as_str() }))
    });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(services, controllers).await;

    let request = Request::get("/me").header("x-user", "ada").body(Body::empty()).unwrap();
    let body = json_body(send(&app.router, request).await).await;
    assert_eq!(body, json!({ "ctx": "ada", "service": "ada" }));
    assert_eq!(built.load(Ordering::SeqCst), 1);

    let response = get(&app.router, "/me").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(built.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_eager_services_are_initialized_on_build() {
    let services = ServiceRegistry::new();
    services
        .register(define_singleton("warm", |_| async { Ok(1u8) }).eager())
        .unwrap();
    let app = ModularApp::new(services.clone(), ControllerRegistry::new());
    app.build().await.unwrap();
    assert!(services.is_singleton_built("warm"));

    let failing = ServiceRegistry::new();
    failing
        .register(define_singleton("cold", |_| async { Err::<u8, BoxError>("no".into()) }).eager())
        .unwrap();
    assert!(ModularApp::new(failing, ControllerRegistry::new()).build().await.is_err());
}

#[tokio::test]
async fn test_invalid_config_fails_the_build() {
    let mut config = ModularConfig::default();
    config.sse.keep_alive_ms = 0;
    let app = ModularApp::new(ServiceRegistry::new(), ControllerRegistry::new()).with_config(config);
    assert!(app.build().await.is_err());
}

// ===== Binding =====

#[tokio::test]
async fn test_colliding_routes_are_skipped() {
    let mut first = ControllerBuilder::<Value>::new().root_path("/a");
    first.get("/b").unwrap().handler(|_| async { Ok("first") });
    first.get("/:id").unwrap().handler(|_| async { Ok("by id") });
    first.get("/:other/x").unwrap().handler(|_| async { Ok("conflicting name") });
    let mut second = ControllerBuilder::<Value>::new().root_path("/a/b");
    second.get("/").unwrap().handler(|_| async { Ok("second") });
    second.head("/").unwrap().handler(|_| async { Ok(()) });

    let mut controllers = ControllerRegistry::new();
    controllers.register(first.finish()).unwrap();
    controllers.register(second.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    let body = json_body(get(&app.router, "/a/b").await).await;
    assert_eq!(body, json!("first"));
    assert!(app.manifest.find(HttpMethod::Get, "/a/b").is_some());
    assert!(app.manifest.find(HttpMethod::Get, "/a/:other/x").is_none());
    assert!(app.manifest.find(HttpMethod::Head, "/a/b").is_some());
    assert_eq!(app.manifest.len(), 3);

    let head = send(&app.router, Request::builder().method(Method::HEAD).uri("/a/b").body(Body::empty()).unwrap()).await;
    assert_eq!(head.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_manifest_lists_bound_routes() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/docs");
    controller
        .post("/")
        .unwrap()
        .body(requires_name)
        .output(requires_name)
        .options(RouteOptions {
            summary: Some("Create a doc".into()),
            ..RouteOptions::default()
        })
        .handler(|opts| async move { Ok(opts.body) });
    controller.delete("/:id").unwrap().handler(|_| async { Ok(()) });
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller.finish()).unwrap();
    let app = bind(ServiceRegistry::new(), controllers).await;

    let create = app.manifest.find(HttpMethod::Post, "/docs").unwrap();
    assert_eq!(create.tags, vec!["docs"]);
    assert_eq!(create.summary.as_deref(), Some("Create a doc"));
    assert!(create.schemas.contains_key("body"));
    assert!(create.responses.contains_key(&200));

    let remove = app.manifest.find(HttpMethod::Delete, "/docs/:id").unwrap();
    assert!(remove.responses.contains_key(&204));
    assert!(remove.responses.contains_key(&500));

    let listed = app.manifest.to_json();
    assert_eq!(listed["routes"].as_array().unwrap().len(), 2);
}
