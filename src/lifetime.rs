//! Service lifetime and build-time definitions.

use std::fmt;

/// Service lifetimes controlling instance caching behavior
///
/// # Examples
///
/// ```rust
/// use ferrous_modular::Lifetime;
///
/// assert_eq!(Lifetime::default(), Lifetime::Singleton);
/// assert_eq!(Lifetime::Request.to_string(), "REQUEST");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lifetime {
    /// Single instance per process, cached forever
    ///
    /// Created on first resolution (or at startup when eager) and shared by
    /// every request and every job.
    #[default]
    Singleton,
    /// Single instance per resolution session
    ///
    /// Each incoming request gets its own cache. Request services receive the
    /// request context in their factory and may never be pulled into a
    /// singleton.
    Request,
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifetime::Singleton => f.write_str("SINGLETON"),
            Lifetime::Request => f.write_str("REQUEST"),
        }
    }
}

/// When a service is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BuildTime {
    /// Constructed on first use
    #[default]
    Lazy,
    /// Constructed by [`ServiceRegistry::initialize_eager`](crate::ServiceRegistry::initialize_eager) at startup
    Eager,
}

impl fmt::Display for BuildTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildTime::Lazy => f.write_str("LAZY"),
            BuildTime::Eager => f.write_str("EAGER"),
        }
    }
}
