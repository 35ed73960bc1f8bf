//! Service registration and the registry that owns definitions and singletons.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::descriptors::ServiceDefinition;
use crate::error::{ModularError, ModularResult, RegistryKind};
use crate::internal::{InFlight, InstanceCache};
use crate::lifetime::BuildTime;
use crate::provider::ServiceContainer;
use crate::worker::WorkerTables;

/// Definition table: insertion order plus a name index.
#[derive(Default)]
pub(crate) struct Definitions {
    ordered: Vec<ServiceDefinition>,
    by_name: HashMap<String, usize>,
}

impl Definitions {
    /// Inserts a definition; an existing name is left untouched.
    fn insert(&mut self, definition: ServiceDefinition) -> ModularResult<()> {
        if self.by_name.contains_key(definition.name()) {
            return Err(ModularError::duplicate(RegistryKind::Service, definition.name()));
        }
        self.by_name.insert(definition.name().to_string(), self.ordered.len());
        self.ordered.push(definition);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.by_name.get(name).map(|&index| &self.ordered[index])
    }
}

struct RegistryInner {
    definitions: RwLock<Definitions>,
    singletons: Arc<InstanceCache>,
    inflight: InFlight,
    worker_tables: Arc<WorkerTables>,
}

/// Owns service definitions and the process-wide singleton cache.
///
/// Cheap to clone; clones share everything. The registry also holds the
/// queue and worker tables so the containers it hands out can reach them; a
/// [`WorkerRegistry`](crate::WorkerRegistry) created with
/// [`WorkerRegistry::new`](crate::WorkerRegistry::new) fills those tables.
///
/// # Examples
///
/// ```rust
/// use ferrous_modular::{define_request, define_singleton, ModularError, ServiceRegistry};
///
/// # async fn example() -> Result<(), ModularError> {
/// let registry = ServiceRegistry::new();
/// registry.register(define_singleton("config", |_| async { Ok(String::from("prod")) }))?;
///
/// // Names are unique.
/// let again = registry.register(define_singleton("config", |_| async { Ok(String::from("dev")) }));
/// assert!(matches!(again, Err(ModularError::DuplicateRegistration { .. })));
///
/// let config = registry.resolve().get::<String>("config").await?;
/// assert_eq!(config.as_str(), "prod");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                definitions: RwLock::new(Definitions::default()),
                singletons: Arc::new(InstanceCache::new()),
                inflight: InFlight::new(),
                worker_tables: Arc::new(WorkerTables::default()),
            }),
        }
    }

    /// Stores a definition.
    ///
    /// # Errors
    ///
    /// `DuplicateRegistration` if the name is taken; the first definition stays.
    pub fn register(&self, definition: impl Into<ServiceDefinition>) -> ModularResult<()> {
        let definition = definition.into();
        let name = definition.name().to_string();
        let lifetime = definition.lifetime();
        let build_time = definition.build_time();
        self.inner.definitions.write().insert(definition)?;
        debug!(service = %name, %lifetime, %build_time, "registered service");
        Ok(())
    }

    /// Registers several definitions, stopping at the first duplicate.
    pub fn register_all<I>(&self, definitions: I) -> ModularResult<()>
    where
        I: IntoIterator,
        I::Item: Into<ServiceDefinition>,
    {
        definitions.into_iter().try_for_each(|definition| self.register(definition))
    }

    /// Builds every eager service once, in registration order.
    ///
    /// Each eager service is resolved in a session of its own, without a
    /// request context.
    ///
    /// # Errors
    ///
    /// The first resolution failure; later eager services are not attempted.
    pub async fn initialize_eager(&self) -> ModularResult<()> {
        let eager: Vec<String> = self
            .inner
            .definitions
            .read()
            .ordered
            .iter()
            .filter(|definition| definition.build_time() == BuildTime::Eager)
            .map(|definition| definition.name().to_string())
            .collect();

        for name in eager {
            self.resolve().get_any(&name).await?;
            info!(service = %name, "initialized eager service");
        }
        Ok(())
    }

    /// Opens a resolution session with no request context.
    pub fn resolve(&self) -> ServiceContainer {
        ServiceContainer::new(self.clone(), None)
    }

    /// Opens a resolution session bound to one request.
    pub fn resolve_for_request(&self, request: RequestContext) -> ServiceContainer {
        ServiceContainer::new(self.clone(), Some(request))
    }

    /// True if a definition with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.definitions.read().get(name).is_some()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .definitions
            .read()
            .ordered
            .iter()
            .map(|definition| definition.name().to_string())
            .collect()
    }

    /// Number of singletons built so far.
    pub fn singleton_count(&self) -> usize {
        self.inner.singletons.len()
    }

    /// True if the singleton `name` has been built.
    pub fn is_singleton_built(&self, name: &str) -> bool {
        self.inner.singletons.contains(name)
    }

    /// Constructions currently in progress, in any session.
    pub fn constructions_in_flight(&self) -> usize {
        self.inner.inflight.building_count()
    }

    /// Resolutions currently parked on another resolution's construction.
    pub fn resolutions_waiting(&self) -> usize {
        self.inner.inflight.waiting_count()
    }

    pub(crate) fn definition(&self, name: &str) -> Option<ServiceDefinition> {
        self.inner.definitions.read().get(name).cloned()
    }

    pub(crate) fn singleton_cache(&self) -> Arc<InstanceCache> {
        Arc::clone(&self.inner.singletons)
    }

    pub(crate) fn inflight(&self) -> &InFlight {
        &self.inner.inflight
    }

    pub(crate) fn worker_tables(&self) -> Arc<WorkerTables> {
        Arc::clone(&self.inner.worker_tables)
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .field("singletons_built", &self.singleton_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{define_request, define_singleton};

    #[test]
    fn duplicate_keeps_first_definition() {
        let registry = ServiceRegistry::new();
        registry
            .register(define_singleton("a", |_| async { Ok(1u32) }))
            .unwrap();
        let err = registry
            .register(define_request("a", |_, _| async { Ok(2u32) }))
            .unwrap_err();
        assert!(matches!(err, ModularError::DuplicateRegistration { kind: RegistryKind::Service, .. }));
        assert_eq!(
            registry.definition("a").unwrap().lifetime(),
            crate::lifetime::Lifetime::Singleton
        );
    }

    #[test]
    fn names_follow_registration_order() {
        let registry = ServiceRegistry::new();
        registry
            .register_all([
                ServiceDefinition::from(define_singleton("z", |_| async { Ok(()) })),
                ServiceDefinition::from(define_singleton("a", |_| async { Ok(()) })),
            ])
            .unwrap();
        assert_eq!(registry.names(), vec!["z".to_string(), "a".to_string()]);
        assert!(registry.contains("a"));
        assert!(!registry.contains("b"));
    }

    #[tokio::test]
    async fn eager_services_are_built_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = ServiceRegistry::new();
        for name in ["first", "lazy", "second"] {
            let order = Arc::clone(&order);
            let service = define_singleton(name, move |_| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(name);
                    Ok(())
                }
            });
            if name == "lazy" {
                registry.register(service).unwrap();
            } else {
                registry.register(service.eager()).unwrap();
            }
        }

        registry.initialize_eager().await.unwrap();
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert!(!registry.is_singleton_built("lazy"));
    }
}
