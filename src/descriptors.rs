//! Service definitions and the typed handles used to declare them.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::context::RequestContext;
use crate::error::{BoxError, ModularError, ModularResult};
use crate::lifetime::{BuildTime, Lifetime};
use crate::provider::ServiceContainer;
use crate::worker::{QueueContainer, WorkerContainer};

// Type-erased Arc for storage
pub(crate) type AnyArc = Arc<dyn Any + Send + Sync>;

type SingletonFactoryFn = dyn Fn(ServiceDeps) -> BoxFuture<'static, Result<AnyArc, BoxError>> + Send + Sync;
type RequestFactoryFn =
    dyn Fn(ServiceDeps, RequestContext) -> BoxFuture<'static, Result<AnyArc, BoxError>> + Send + Sync;

/// Lookup surface handed to every factory, processor, listener, middleware
/// and handler.
#[derive(Clone)]
pub struct ServiceDeps {
    /// Service lookup, bound to the caller's resolution session
    pub services: ServiceContainer,
    /// Worker lookup by queue name
    pub workers: WorkerContainer,
    /// Queue lookup by queue name
    pub queues: QueueContainer,
}

/// Type-erased factory, tagged with the lifetime it was declared for.
///
/// Only request factories take a [`RequestContext`]; a singleton factory has
/// no way to reach per-request state.
#[derive(Clone)]
pub(crate) enum ServiceFactory {
    Singleton(Arc<SingletonFactoryFn>),
    Request(Arc<RequestFactoryFn>),
}

/// A registered service: name, factory, lifetime and build time.
///
/// Immutable once created. Obtain one from [`define_singleton`] or
/// [`define_request`] and hand it to
/// [`ServiceRegistry::register`](crate::ServiceRegistry::register).
#[derive(Clone)]
pub struct ServiceDefinition {
    name: Arc<str>,
    pub(crate) factory: ServiceFactory,
    build_time: BuildTime,
}

impl ServiceDefinition {
    /// Unique service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance lifetime, fixed by the kind of factory.
    pub fn lifetime(&self) -> Lifetime {
        match self.factory {
            ServiceFactory::Singleton(_) => Lifetime::Singleton,
            ServiceFactory::Request(_) => Lifetime::Request,
        }
    }

    /// Whether the service is built at startup.
    pub fn build_time(&self) -> BuildTime {
        self.build_time
    }
}

impl std::fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("lifetime", &self.lifetime())
            .field("build_time", &self.build_time)
            .finish()
    }
}

/// Typed handle to a service definition.
///
/// Keeps the instance type next to the name so lookups do not repeat it.
///
/// # Examples
///
/// ```rust
/// use ferrous_modular::{define_singleton, ServiceRegistry};
///
/// struct Greeter { greeting: String }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let greeter = define_singleton("greeter", |_deps| async {
///     Ok(Greeter { greeting: "hello".to_string() })
/// });
///
/// let registry = ServiceRegistry::new();
/// registry.register(&greeter)?;
///
/// let services = registry.resolve();
/// let instance = greeter.get(&services).await?;
/// assert_eq!(instance.greeting, "hello");
/// # Ok(())
/// # }
/// ```
pub struct Service<T> {
    definition: ServiceDefinition,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Service<T> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Service<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Service").field(&self.definition).finish()
    }
}

impl<T: Send + Sync + 'static> Service<T> {
    /// Service name.
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// Underlying definition.
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// Resolves this service through `services`.
    pub async fn get(&self, services: &ServiceContainer) -> ModularResult<Arc<T>> {
        services.get::<T>(self.name()).await
    }
}

impl<T> From<Service<T>> for ServiceDefinition {
    fn from(service: Service<T>) -> Self {
        service.definition
    }
}

impl<T> From<&Service<T>> for ServiceDefinition {
    fn from(service: &Service<T>) -> Self {
        service.definition.clone()
    }
}

/// Typed handle to a singleton definition; the only kind that can be eager.
pub struct SingletonService<T>(Service<T>);

impl<T> SingletonService<T> {
    /// Builds the service at startup instead of on first use.
    pub fn eager(mut self) -> Self {
        self.0.definition.build_time = BuildTime::Eager;
        self
    }

    /// Drops the singleton marker.
    pub fn into_service(self) -> Service<T> {
        self.0
    }
}

impl<T> Clone for SingletonService<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> std::ops::Deref for SingletonService<T> {
    type Target = Service<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<SingletonService<T>> for ServiceDefinition {
    fn from(service: SingletonService<T>) -> Self {
        service.0.definition
    }
}

impl<T> From<&SingletonService<T>> for ServiceDefinition {
    fn from(service: &SingletonService<T>) -> Self {
        service.0.definition.clone()
    }
}

/// Declares a singleton service, built lazily unless marked [`eager`](SingletonService::eager).
pub fn define_singleton<T, F, Fut>(name: impl Into<String>, factory: F) -> SingletonService<T>
where
    T: Send + Sync + 'static,
    F: Fn(ServiceDeps) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    let erased = move |deps: ServiceDeps| -> BoxFuture<'static, Result<AnyArc, BoxError>> {
        factory(deps).map(|result| result.map(|value| Arc::new(value) as AnyArc)).boxed()
    };
    SingletonService(Service {
        definition: ServiceDefinition {
            name: Arc::from(name.into()),
            factory: ServiceFactory::Singleton(Arc::new(erased)),
            build_time: BuildTime::Lazy,
        },
        _marker: PhantomData,
    })
}

/// Declares a request scoped service.
///
/// The factory receives the request context of the session it is resolved
/// in. Request services are always lazy.
pub fn define_request<T, F, Fut>(name: impl Into<String>, factory: F) -> Service<T>
where
    T: Send + Sync + 'static,
    F: Fn(ServiceDeps, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    let erased = move |deps: ServiceDeps, request: RequestContext| -> BoxFuture<'static, Result<AnyArc, BoxError>> {
        factory(deps, request)
            .map(|result| result.map(|value| Arc::new(value) as AnyArc))
            .boxed()
    };
    Service {
        definition: ServiceDefinition {
            name: Arc::from(name.into()),
            factory: ServiceFactory::Request(Arc::new(erased)),
            build_time: BuildTime::Lazy,
        },
        _marker: PhantomData,
    }
}

pub(crate) fn downcast_instance<T: Send + Sync + 'static>(name: &str, any: AnyArc) -> ModularResult<Arc<T>> {
    any.downcast::<T>().map_err(|_| ModularError::TypeMismatch {
        name: name.to_string(),
        expected: std::any::type_name::<T>(),
    })
}
