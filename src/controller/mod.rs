//! Controllers: groups of routes sharing a root path and a middleware chain.
//!
//! A controller is declared in stages. [`ControllerBuilder`] collects
//! middleware, [`ControllerBuilder::root_path`] fixes the mount point and
//! yields a [`Controller`] accepting routes, and [`Controller::finish`]
//! freezes everything into a [`ControllerDescriptor`].
//!
//! ```rust
//! use ferrous_modular::controller::{ControllerBuilder, ControllerRegistry};
//! use ferrous_modular::middleware::middleware;
//! use serde_json::{json, Value};
//!
//! # fn main() -> Result<(), ferrous_modular::ModularError> {
//! let mut health = ControllerBuilder::<Value>::new()
//!     .use_middleware(middleware(|args, next| async move {
//!         let mut ctx: Value = args.ctx;
//!         ctx["checked"] = json!(true);
//!         next.run(ctx).await
//!     }))
//!     .root_path("/health");
//! health.get("/")?.handler(|opts| async move { Ok(opts.ctx) });
//!
//! let mut controllers = ControllerRegistry::new();
//! controllers.register(health.finish())?;
//! assert_eq!(controllers.root_paths(), vec!["/health"]);
//! # Ok(())
//! # }
//! ```

pub mod route;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ModularError, ModularResult, RegistryKind};
use crate::http::BindController;
use crate::middleware::{Chain, Middleware};

pub use route::{
    described, Described, EventStream, HandlerOpts, HttpMethod, NoBody, OpenBody, RouteBuilder, RouteDescriptor,
    RouteHandler, RouteOptions, RouteSchemas, Schema,
};

fn check_path(path: &str) -> ModularResult<()> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(ModularError::InvalidPath(path.to_string()))
    }
}

/// Joins a controller root and a route path. `"/"` maps to the root itself.
pub fn compose_path(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    match (root.is_empty(), path) {
        (true, path) => path.to_string(),
        (false, "/") => root.to_string(),
        (false, path) => format!("{root}{path}"),
    }
}

/// First stage: middleware may still be added.
pub struct ControllerBuilder<C> {
    middlewares: Vec<Middleware<C>>,
}

impl<C> Default for ControllerBuilder<C> {
    fn default() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }
}

impl<C> ControllerBuilder<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware. Middleware run in the order they are added.
    pub fn use_middleware(mut self, middleware: Middleware<C>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Fixes the mount point; routes can be declared from here on.
    ///
    /// The root is validated when the controller is registered.
    pub fn root_path(self, root: impl Into<String>) -> Controller<C> {
        Controller {
            root_path: root.into(),
            middlewares: self.middlewares,
            routes: Vec::new(),
        }
    }
}

/// Second stage: routes are declared through the method shortcuts in
/// [`route`].
pub struct Controller<C> {
    pub(crate) root_path: String,
    middlewares: Vec<Middleware<C>>,
    pub(crate) routes: Vec<RouteDescriptor<C>>,
}

impl<C> Controller<C> {
    pub fn root(&self) -> &str {
        &self.root_path
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Freezes the controller.
    pub fn finish(self) -> ControllerDescriptor<C> {
        ControllerDescriptor {
            root_path: self.root_path,
            middlewares: self.middlewares,
            routes: self.routes,
        }
    }
}

/// Frozen controller, ready to be registered.
pub struct ControllerDescriptor<C> {
    root_path: String,
    middlewares: Vec<Middleware<C>>,
    routes: Vec<RouteDescriptor<C>>,
}

impl<C> ControllerDescriptor<C> {
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn routes(&self) -> &[RouteDescriptor<C>] {
        &self.routes
    }

    pub fn middleware_count(&self) -> usize {
        self.middlewares.len()
    }

    /// Full path of a route of this controller.
    pub fn composed_path(&self, route: &RouteDescriptor<C>) -> String {
        compose_path(&self.root_path, route.path())
    }
}

impl<C> ControllerDescriptor<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Composes the middleware chain. Done once per controller at bind time.
    pub fn chain(&self) -> Chain<C> {
        Chain::new(self.middlewares.clone())
    }
}

impl<C> std::fmt::Debug for ControllerDescriptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerDescriptor")
            .field("root_path", &self.root_path)
            .field("middlewares", &self.middlewares.len())
            .field("routes", &self.routes)
            .finish()
    }
}

/// Every controller of the application, keyed by root path.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Vec<Arc<dyn BindController>>,
    roots: HashSet<String>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a controller. The context type may differ between controllers.
    ///
    /// # Errors
    ///
    /// `DuplicateRegistration` if the root path is taken, `InvalidPath` if
    /// it does not start with `/`. The registry is left unchanged.
    pub fn register<C>(&mut self, controller: ControllerDescriptor<C>) -> ModularResult<()>
    where
        C: Clone + Default + Send + Sync + 'static,
    {
        check_path(controller.root_path())?;
        if self.roots.contains(controller.root_path()) {
            return Err(ModularError::duplicate(RegistryKind::Controller, controller.root_path()));
        }
        debug!(
            route = controller.root_path(),
            routes = controller.routes().len(),
            "registering controller"
        );
        self.roots.insert(controller.root_path().to_string());
        self.controllers.push(Arc::new(controller));
        Ok(())
    }

    /// Root paths in registration order.
    pub fn root_paths(&self) -> Vec<&str> {
        self.controllers.iter().map(|c| c.root_path()).collect()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub(crate) fn controllers(&self) -> &[Arc<dyn BindController>] {
        &self.controllers
    }
}

impl std::fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("roots", &self.root_paths())
            .finish()
    }
}
