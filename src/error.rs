//! Error types for registration, resolution and the middleware protocol.

use thiserror::Error;

use crate::lifetime::Lifetime;

/// Boxed error returned by user supplied factories, processors and listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which registry a name belongs to.
///
/// Service names, queue names and controller root paths live in separate
/// namespaces, so the same string may be used in more than one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    /// Service registry definition table
    Service,
    /// Worker registry queue table
    Queue,
    /// Worker registry worker table
    Worker,
    /// Controller registry, keyed by root path
    Controller,
    /// Routes of a single controller, keyed by method and path
    Route,
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RegistryKind::Service => "Service",
            RegistryKind::Queue => "Queue",
            RegistryKind::Worker => "Worker",
            RegistryKind::Controller => "Controller",
            RegistryKind::Route => "Route",
        };
        f.write_str(label)
    }
}

/// Errors raised by the composition layer itself.
///
/// Registration errors (`DuplicateRegistration`) are meant to abort startup.
/// Lookup and resolution errors are surfaced to the caller, which at the HTTP
/// boundary means they end up as an `INTERNAL_ERROR` response.
///
/// # Examples
///
/// ```rust
/// use ferrous_modular::{ModularError, RegistryKind};
///
/// let err = ModularError::Circular(vec!["a".into(), "b".into(), "a".into()]);
/// assert_eq!(err.to_string(), "Circular dependency detected while resolving: a -> b -> a");
///
/// let err = ModularError::NotFound { kind: RegistryKind::Queue, name: "mail".into() };
/// assert!(err.is_not_found());
/// ```
#[derive(Debug, Error)]
pub enum ModularError {
    /// A name was registered twice in the same registry
    #[error("{kind} \"{name}\" already registered.")]
    DuplicateRegistration {
        /// Registry the name collided in
        kind: RegistryKind,
        /// The colliding name (for routes: `METHOD /root/path`)
        name: String,
    },

    /// No service definition with this name
    #[error("No service named \"{0}\" found!")]
    UnknownService(String),

    /// No queue or worker with this name
    #[error("No {kind} named \"{name}\" found.")]
    NotFound {
        /// Registry that was searched
        kind: RegistryKind,
        /// The name that missed
        name: String,
    },

    /// Resolution revisited a service already on its own resolution path
    #[error("Circular dependency detected while resolving: {}", .0.join(" -> "))]
    Circular(Vec<String>),

    /// A request scoped service was requested while building a singleton
    #[error("Request scoped service \"{service}\" cannot be resolved from singleton service \"{singleton}\".")]
    ScopeViolation {
        /// The request scoped service
        service: String,
        /// The singleton whose factory asked for it
        singleton: String,
    },

    /// A request scoped service was resolved outside of any request
    #[error("No request context available for request scoped service \"{0}\"")]
    MissingRequestContext(String),

    /// The instance stored under a name is not of the requested type
    #[error("Service \"{name}\" is not of type {expected}")]
    TypeMismatch {
        /// Service name
        name: String,
        /// Requested Rust type
        expected: &'static str,
    },

    /// A middleware invoked its `next` continuation more than once
    #[error("next() called multiple times")]
    DoubleNext,

    /// A service factory failed
    #[error("Factory for {lifetime} service \"{name}\" failed: {source}")]
    Factory {
        /// Service name
        name: String,
        /// Lifetime of the failing definition
        lifetime: Lifetime,
        /// Error returned by the factory
        #[source]
        source: BoxError,
    },

    /// The queue engine rejected an operation
    #[error("Queue engine error on \"{queue}\": {source}")]
    Queue {
        /// Queue the operation targeted
        queue: String,
        /// Engine error
        #[source]
        source: BoxError,
    },

    /// Controller root or route path that cannot be mounted
    #[error("Path \"{0}\" must start with '/'")]
    InvalidPath(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Listener or config file I/O failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ModularError {
    /// Shorthand for a duplicate-name error.
    pub fn duplicate(kind: RegistryKind, name: impl Into<String>) -> Self {
        ModularError::DuplicateRegistration { kind, name: name.into() }
    }

    /// Shorthand for a missing queue/worker error.
    pub fn not_found(kind: RegistryKind, name: impl Into<String>) -> Self {
        ModularError::NotFound { kind, name: name.into() }
    }

    /// Returns true for every lookup miss, services included.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ModularError::NotFound { .. } | ModularError::UnknownService(_))
    }
}

/// Result type for composition-layer operations.
pub type ModularResult<T> = Result<T, ModularError>;
