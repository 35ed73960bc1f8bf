//! HTTP binding over axum.
//!
//! [`ModularApp`] turns the registered controllers into an axum [`Router`].
//! Binding initializes eager services, composes each controller's middleware
//! chain once, then mounts one endpoint per route. Per request an endpoint
//! parses and validates the input, opens a request session, runs the chain
//! from `C::default()` and calls the handler; every failure along the way is
//! rendered as the JSON error body.
//!
//! ```rust,no_run
//! use ferrous_modular::controller::{ControllerBuilder, ControllerRegistry};
//! use ferrous_modular::{ModularApp, ServiceRegistry};
//! use serde_json::{json, Value};
//!
//! # async fn run() -> Result<(), ferrous_modular::ModularError> {
//! let mut hello = ControllerBuilder::<Value>::new().root_path("/hello");
//! hello.get("/")?.handler(|_| async { Ok(json!({ "hello": "world" })) });
//!
//! let mut controllers = ControllerRegistry::new();
//! controllers.register(hello.finish())?;
//!
//! ModularApp::new(ServiceRegistry::new(), controllers)
//!     .listen(async { let _ = tokio::signal::ctrl_c().await; })
//!     .await
//! # }
//! ```

mod endpoint;
pub mod manifest;
pub mod sse;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::extract::{Path, Query, Request};
use axum::http::{Method, Uri};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ModularConfig;
use crate::controller::{ControllerDescriptor, ControllerRegistry, HttpMethod};
use crate::error::ModularResult;
use crate::registration::ServiceRegistry;
use crate::route_error::GenericRouteError;
use crate::worker::WorkerRegistry;

use endpoint::Endpoint;
pub use manifest::{ResponseEntry, RouteEntry, RouteManifest};

fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::Get | HttpMethod::Sse => MethodFilter::GET,
        HttpMethod::Head => MethodFilter::HEAD,
        HttpMethod::Post => MethodFilter::POST,
        HttpMethod::Put => MethodFilter::PUT,
        HttpMethod::Patch => MethodFilter::PATCH,
        HttpMethod::Delete => MethodFilter::DELETE,
    }
}

async fn unmatched(method: Method, uri: Uri) -> GenericRouteError {
    GenericRouteError::not_found(format!("Route {method}:{} not found", uri.path()))
}

/// Collects routes into a router while binding.
pub(crate) struct Binder<'a> {
    router: Router,
    manifest: RouteManifest,
    mounted: HashSet<(Method, String)>,
    services: &'a ServiceRegistry,
    config: &'a ModularConfig,
}

impl<'a> Binder<'a> {
    fn new(services: &'a ServiceRegistry, config: &'a ModularConfig) -> Self {
        Self {
            router: Router::new(),
            manifest: RouteManifest::default(),
            mounted: HashSet::new(),
            services,
            config,
        }
    }

    /// Mounts one endpoint. A route axum refuses is logged and skipped.
    fn mount(&mut self, method: HttpMethod, path: String, endpoint: MethodRouter, entry: RouteEntry) {
        let key = (method.wire_method(), path.clone());
        if self.mounted.contains(&key) {
            error!(route = %path, %method, "Route {method} {path} skipped: already bound.");
            return;
        }
        let candidate = self.router.clone();
        match catch_unwind(AssertUnwindSafe(|| candidate.route(&path, endpoint))) {
            Ok(router) => {
                info!(route = %path, %method, "route bound");
                self.router = router;
                self.mounted.insert(key);
                self.manifest.push(entry);
            }
            Err(_) => error!(route = %path, %method, "Route {method} {path} skipped: rejected by the router."),
        }
    }
}

/// A controller with its context type erased.
pub(crate) trait BindController: Send + Sync {
    fn root_path(&self) -> &str;

    fn bind(&self, binder: &mut Binder<'_>);
}

impl<C> BindController for ControllerDescriptor<C>
where
    C: Clone + Default + Send + Sync + 'static,
{
    fn root_path(&self) -> &str {
        ControllerDescriptor::root_path(self)
    }

    fn bind(&self, binder: &mut Binder<'_>) {
        let chain = self.chain();
        for route in self.routes() {
            let path = self.composed_path(route);
            let entry = RouteEntry::new(route.method(), path.clone(), self.root_path(), route.schemas(), route.options());
            let endpoint = Arc::new(Endpoint {
                path: path.clone(),
                route: route.clone(),
                chain: chain.clone(),
                services: binder.services.clone(),
                body_limit: route.options().body_limit.unwrap_or(binder.config.server.body_limit),
                keep_alive: binder.config.sse.keep_alive(),
            });
            let handler = on(
                method_filter(route.method()),
                move |params: Option<Path<HashMap<String, String>>>,
                      query: Option<Query<HashMap<String, String>>>,
                      request: Request| {
                    let endpoint = Arc::clone(&endpoint);
                    async move {
                        let params = params.map(|Path(params)| params).unwrap_or_default();
                        let query = query.map(|Query(query)| query).unwrap_or_default();
                        endpoint.serve(params, query, request).await
                    }
                },
            );
            binder.mount(route.method(), path, handler, entry);
        }
    }
}

/// The result of binding: the router plus what it serves.
#[derive(Debug)]
pub struct BoundApp {
    pub router: Router,
    pub manifest: RouteManifest,
}

/// Services, workers and controllers assembled into one HTTP application.
pub struct ModularApp {
    services: ServiceRegistry,
    controllers: ControllerRegistry,
    workers: Option<WorkerRegistry>,
    config: ModularConfig,
}

impl ModularApp {
    pub fn new(services: ServiceRegistry, controllers: ControllerRegistry) -> Self {
        Self {
            services,
            controllers,
            workers: None,
            config: ModularConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ModularConfig) -> Self {
        self.config = config;
        self
    }

    /// Workers whose queues are resumed on [`serve`](Self::serve) and
    /// closed on shutdown.
    pub fn with_workers(mut self, workers: WorkerRegistry) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn controllers(&self) -> &ControllerRegistry {
        &self.controllers
    }

    pub fn config(&self) -> &ModularConfig {
        &self.config
    }

    /// Initializes eager services and binds every controller.
    ///
    /// # Errors
    ///
    /// Invalid configuration or a failing eager service. Routes that cannot
    /// be mounted are logged and left out of the router and manifest.
    pub async fn build(&self) -> ModularResult<BoundApp> {
        self.config.validate()?;
        self.services.initialize_eager().await?;

        let mut binder = Binder::new(&self.services, &self.config);
        for controller in self.controllers.controllers() {
            controller.bind(&mut binder);
        }
        info!(
            controllers = self.controllers.len(),
            routes = binder.manifest.len(),
            "controllers bound"
        );
        Ok(BoundApp {
            router: binder.router.fallback(unmatched),
            manifest: binder.manifest,
        })
    }

    /// Serves on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> ModularResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bound = self.build().await?;
        if let Some(workers) = &self.workers {
            workers.resume_queues().await?;
        }

        info!(address = %listener.local_addr()?, "listening");
        let served = axum::serve(listener, bound.router)
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some(workers) = &self.workers {
            workers.close_all().await?;
        }
        served?;
        Ok(())
    }

    /// Binds `server.host:server.port` and serves until `shutdown` resolves.
    pub async fn listen<F>(self, shutdown: F) -> ModularResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind((self.config.server.host.as_str(), self.config.server.port)).await?;
        self.serve(listener, shutdown).await
    }
}

impl std::fmt::Debug for ModularApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModularApp")
            .field("services", &self.services)
            .field("controllers", &self.controllers)
            .field("workers", &self.workers.is_some())
            .field("config", &self.config)
            .finish()
    }
}
