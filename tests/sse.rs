use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use ferrous_modular::controller::{ControllerBuilder, ControllerRegistry};
use ferrous_modular::middleware::{middleware, MiddlewareArgs, Next};
use ferrous_modular::{BoundApp, GenericRouteError, HttpMethod, ModularApp, RouteFailure, ServiceRegistry};
use futures::stream;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn bind(controller: ferrous_modular::ControllerDescriptor<Value>) -> BoundApp {
    let mut controllers = ControllerRegistry::new();
    controllers.register(controller).unwrap();
    ModularApp::new(ServiceRegistry::new(), controllers)
        .build()
        .await
        .unwrap()
}

async fn body_text(app: &BoundApp, uri: &str) -> (StatusCode, header::HeaderMap, String) {
    let response = app
        .router
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_events_are_framed_in_order() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/events");
    controller.sse("/").unwrap().handler(|_| {
        stream::iter(vec![
            Ok::<_, RouteFailure>(json!({ "n": 1 })),
            Ok(json!({ "n": 2 })),
        ])
    });
    let app = bind(controller.finish()).await;

    let (status, headers, body) = body_text(&app, "/events").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "data: {\"n\":1}\n\ndata: {\"n\":2}\n\n");
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream; charset=utf-8");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache,no-transform");
    assert_eq!(headers["x-no-compression"], "1");
    assert!(app.manifest.find(HttpMethod::Sse, "/events").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_error_item_ends_the_stream() {
    let mut controller = ControllerBuilder::<Value>::new().root_path("/feed");
    controller.sse("/").unwrap().handler(|_| {
        stream::iter(vec![
            Ok(json!("first")),
            Err(RouteFailure::from(GenericRouteError::forbidden("Feed closed."))),
            Ok(json!("never")),
        ])
    });
    let app = bind(controller.finish()).await;

    let (status, _, body) = body_text(&app, "/feed").await;
    assert_eq!(status, StatusCode::OK);
    let (data, error) = body.split_once("error: ").unwrap();
    assert_eq!(data, "data: \"first\"\n\n");
    assert!(error.ends_with("\n\n"));
    let error: Value = serde_json::from_str(error.trim_end()).unwrap();
    assert_eq!(error["status"], "FORBIDDEN");
    assert_eq!(error["message"], "Feed closed.");
    assert!(!body.contains("never"));
}

#[tokio::test(start_paused = true)]
async fn test_middleware_failure_is_sent_as_json() {
    let mut controller = ControllerBuilder::<Value>::new()
        .use_middleware(middleware(|_args: MiddlewareArgs<Value>, _next: Next<Value>| async {
            Err(GenericRouteError::unauthorized("No stream for you.").into())
        }))
        .root_path("/guarded");
    controller
        .sse("/")
        .unwrap()
        .handler(|_| stream::iter(vec![Ok::<_, RouteFailure>(json!(1))]));
    let app = bind(controller.finish()).await;

    let (status, headers, body) = body_text(&app, "/guarded").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["message"], "No stream for you.");
}

#[tokio::test(start_paused = true)]
async fn test_handlers_see_middleware_context() {
    let mut controller = ControllerBuilder::<Value>::new()
        .use_middleware(middleware(|args: MiddlewareArgs<Value>, next: Next<Value>| async move {
            let mut ctx = args.ctx;
            ctx = json!({ "room": "lobby", "was": ctx });
            next.run(ctx).await
        }))
        .root_path("/rooms");
    controller.sse("/").unwrap().handler(|opts| {
        let room = opts.ctx["room"].clone();
        stream::once(async move { Ok::<_, RouteFailure>(room) })
    });
    let app = bind(controller.finish()).await;

    let (_, _, body) = body_text(&app, "/rooms").await;
    assert_eq!(body, "data: \"lobby\"\n\n");
}
