//! Service containers: the lookup surface bound to one resolution session.
//!
//! A container is obtained from [`ServiceRegistry::resolve`] (no request) or
//! [`ServiceRegistry::resolve_for_request`]. Request scoped instances are
//! cached per container session; singletons are cached in the registry.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::context::RequestContext;
use crate::descriptors::{downcast_instance, AnyArc, ServiceDeps, ServiceFactory};
use crate::error::{ModularError, ModularResult};
use crate::internal::{next_id, Claim};
use crate::lifetime::Lifetime;
use crate::registration::ServiceRegistry;
use crate::worker::{QueueContainer, WorkerContainer};

mod session;

pub use session::Frame;
pub(crate) use session::Session;

/// Resolves services by name within one resolution session.
///
/// Cloning is cheap and keeps the session: clones share the request cache.
/// The container passed to a factory additionally carries the frames of the
/// services currently being built above it, which is how cycles and scope
/// violations are detected.
///
/// # Examples
///
/// ```rust
/// use ferrous_modular::{define_singleton, ServiceRegistry};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = ServiceRegistry::new();
/// registry.register(define_singleton("answer", |_| async { Ok(42u32) }))?;
///
/// let first = registry.resolve().get::<u32>("answer").await?;
/// let second = registry.resolve().get::<u32>("answer").await?;
/// assert!(Arc::ptr_eq(&first, &second));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServiceContainer {
    registry: ServiceRegistry,
    session: Arc<Session>,
    path: Arc<[Frame]>,
}

impl ServiceContainer {
    pub(crate) fn new(registry: ServiceRegistry, request: Option<RequestContext>) -> Self {
        Self {
            registry,
            session: Arc::new(Session::new(request)),
            path: Arc::from(Vec::new()),
        }
    }

    fn child(&self, frame: Frame) -> Self {
        let mut path = self.path.to_vec();
        path.push(frame);
        Self {
            registry: self.registry.clone(),
            session: Arc::clone(&self.session),
            path: Arc::from(path),
        }
    }

    /// Resolves `name` and downcasts it to `T`.
    ///
    /// # Errors
    ///
    /// `UnknownService`, `Circular`, `ScopeViolation`, `MissingRequestContext`,
    /// `TypeMismatch`, or the error of a failing factory.
    pub async fn get<T: Send + Sync + 'static>(&self, name: &str) -> ModularResult<Arc<T>> {
        let any = self.get_any(name).await?;
        downcast_instance(name, any)
    }

    pub(crate) async fn get_any(&self, name: &str) -> ModularResult<AnyArc> {
        let definition = self
            .registry
            .definition(name)
            .ok_or_else(|| ModularError::UnknownService(name.to_string()))?;
        let lifetime = definition.lifetime();

        if self.path.iter().any(|frame| frame.name() == name) {
            return Err(ModularError::Circular(self.cycle_path(name)));
        }

        if lifetime == Lifetime::Request {
            if let Some(enclosing) = self.path.last() {
                if enclosing.lifetime() == Lifetime::Singleton {
                    return Err(ModularError::ScopeViolation {
                        service: name.to_string(),
                        singleton: enclosing.name().to_string(),
                    });
                }
            }
        }

        let cache = match lifetime {
            Lifetime::Singleton => self.registry.singleton_cache(),
            Lifetime::Request => Arc::clone(&self.session.cache),
        };
        let inflight = self.registry.inflight();
        let me = next_id();
        let ancestors: Vec<_> = self.path.iter().map(|frame| frame.claim).collect();

        loop {
            let build = match inflight.claim(&cache, name, me, &ancestors) {
                Claim::Ready(value) => {
                    trace!(service = name, %lifetime, "cache hit");
                    return Ok(value);
                }
                Claim::Deadlock => return Err(ModularError::Circular(self.cycle_path(name))),
                Claim::Wait { notify, guard } => {
                    let notified = notify.notified();
                    if guard.still_building() {
                        trace!(service = name, "waiting for in-flight construction");
                        notified.await;
                    }
                    continue;
                }
                Claim::Build(build) => build,
            };

            let deps = self.child(Frame::new(name, lifetime, me)).deps();
            debug!(service = name, %lifetime, session = self.session.id, "constructing service");
            let produced = match &definition.factory {
                ServiceFactory::Singleton(factory) => factory(deps).await,
                ServiceFactory::Request(factory) => {
                    let request = self
                        .session
                        .request
                        .clone()
                        .ok_or_else(|| ModularError::MissingRequestContext(name.to_string()))?;
                    factory(deps, request).await
                }
            };

            return match produced {
                Ok(value) => Ok(build.finish(value)),
                Err(source) => {
                    drop(build);
                    // Resolution errors raised further down keep their identity.
                    match source.downcast::<ModularError>() {
                        Ok(inner) => Err(*inner),
                        Err(source) => Err(ModularError::Factory {
                            name: name.to_string(),
                            lifetime,
                            source,
                        }),
                    }
                }
            };
        }
    }

    fn cycle_path(&self, name: &str) -> Vec<String> {
        self.path
            .iter()
            .map(|frame| frame.name().to_string())
            .chain(std::iter::once(name.to_string()))
            .collect()
    }

    /// Services, workers and queues as seen from this container.
    pub fn deps(&self) -> ServiceDeps {
        let tables = self.registry.worker_tables();
        ServiceDeps {
            services: self.clone(),
            workers: WorkerContainer::new(Arc::clone(&tables)),
            queues: QueueContainer::new(tables),
        }
    }

    /// Frames of the services being built above this container, outermost first.
    ///
    /// Always empty for a container returned by `resolve`.
    pub fn resolution_stack(&self) -> &[Frame] {
        &self.path
    }

    /// The request this session belongs to, if any.
    pub fn request(&self) -> Option<&RequestContext> {
        self.session.request.as_ref()
    }

    /// True if `name` already has a request scoped instance in this session.
    pub fn is_request_cached(&self, name: &str) -> bool {
        self.session.cache.contains(name)
    }

    /// Number of request scoped instances built in this session.
    pub fn request_instance_count(&self) -> usize {
        self.session.cache.len()
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("session", &self.session.id)
            .field("has_request", &self.session.request.is_some())
            .field("stack", &self.path)
            .finish()
    }
}
