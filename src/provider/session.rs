//! Resolution session state.

use std::sync::Arc;

use crate::context::RequestContext;
use crate::internal::{next_id, ClaimId, InstanceCache};
use crate::lifetime::Lifetime;

/// One entry of the active resolution stack.
///
/// The stack is carried by value inside each [`ServiceContainer`](super::ServiceContainer)
/// handed to a factory, so it unwinds by construction on every exit path and
/// concurrent resolutions never see each other's frames.
#[derive(Debug, Clone)]
pub struct Frame {
    name: Arc<str>,
    lifetime: Lifetime,
    pub(crate) claim: ClaimId,
}

impl Frame {
    pub(crate) fn new(name: &str, lifetime: Lifetime, claim: ClaimId) -> Self {
        Self {
            name: Arc::from(name),
            lifetime,
            claim,
        }
    }

    /// Name of the service being built.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Its lifetime.
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }
}

/// Per-session state shared by every container derived from one `resolve` call.
pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) request: Option<RequestContext>,
    pub(crate) cache: Arc<InstanceCache>,
}

impl Session {
    pub(crate) fn new(request: Option<RequestContext>) -> Self {
        Self {
            id: next_id(),
            request,
            cache: Arc::new(InstanceCache::new()),
        }
    }
}
