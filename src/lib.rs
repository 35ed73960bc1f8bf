//! # ferrous-modular
//!
//! Typed composition layer for services, background workers and HTTP
//! controllers, on top of axum and a pluggable job-queue engine.
//!
//! ## Features
//!
//! - **Named services**: singleton or request lifetime, lazy or eager, with
//!   cycle and scope-violation detection
//! - **Single construction**: concurrent first resolutions share one factory call
//! - **Workers**: queues, job schedulers and event listeners over any [`QueueEngine`]
//! - **Middleware**: ordered, short-circuiting context pipeline per controller
//! - **Controllers**: stage-typed route builders, JSON and server-sent events
//! - **Structured errors**: every failure becomes the same JSON error body
//!
//! ## Quick Start
//!
//! ```rust
//! use ferrous_modular::controller::{ControllerBuilder, ControllerRegistry};
//! use ferrous_modular::{define_singleton, ModularApp, ServiceRegistry};
//! use serde_json::{json, Value};
//!
//! struct Greeter {
//!     greeting: String,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ferrous_modular::ModularError> {
//! let greeter = define_singleton("greeter", |_deps| async {
//!     Ok(Greeter { greeting: "hello".to_string() })
//! });
//!
//! let services = ServiceRegistry::new();
//! services.register(&greeter)?;
//!
//! let mut hello = ControllerBuilder::<Value>::new().root_path("/hello");
//! let handle = greeter.clone();
//! hello.get("/:name")?.handler(move |opts| {
//!     let greeter = handle.clone();
//!     async move {
//!         let greeter = greeter.get(&opts.services).await?;
//!         Ok(json!({ "message": format!("{} {}", greeter.greeting, opts.params["name"]) }))
//!     }
//! });
//!
//! let mut controllers = ControllerRegistry::new();
//! controllers.register(hello.finish())?;
//!
//! let app = ModularApp::new(services, controllers).build().await?;
//! assert_eq!(app.manifest.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifetimes
//!
//! - **Singleton**: built once per process, shared by every request and job
//! - **Request**: built once per resolution session; each HTTP request gets
//!   its own session, and only request factories see the [`RequestContext`]
//!
//! ## Workers
//!
//! Queues are created paused. Schedulers are upserted before the worker
//! starts, and [`WorkerRegistry::resume_queues`] releases them once the
//! application is ready.

pub mod cancellation;
pub mod config;
pub mod context;
pub mod controller;
pub mod descriptors;
pub mod error;
pub mod http;
pub mod lifetime;
pub mod middleware;
pub mod provider;
pub mod route_error;
pub mod worker;

mod internal;
mod registration;

pub use cancellation::{CancellationToken, DropGuard};
pub use config::ModularConfig;
pub use context::{Reply, RequestContext, RequestHead};
pub use controller::{ControllerBuilder, ControllerDescriptor, ControllerRegistry, HandlerOpts, HttpMethod};
pub use descriptors::{define_request, define_singleton, Service, ServiceDefinition, ServiceDeps, SingletonService};
pub use error::{BoxError, ModularError, ModularResult, RegistryKind};
pub use http::{BoundApp, ModularApp, RouteManifest};
pub use lifetime::{BuildTime, Lifetime};
pub use middleware::{middleware, Chain, Middleware, MiddlewareArgs, Next};
pub use provider::{Frame, ServiceContainer};
pub use registration::ServiceRegistry;
pub use route_error::{ErrorStatus, GenericRouteError, RouteFailure};
pub use worker::{QueueContainer, QueueEngine, QueueHandle, RegisterMode, WorkerContainer, WorkerHandle, WorkerRegistry};

#[cfg(feature = "memory-engine")]
pub use worker::memory::MemoryEngine;
