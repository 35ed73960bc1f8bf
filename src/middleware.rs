//! Per-request middleware pipeline.
//!
//! A middleware receives the current context together with the request's
//! lookup surface and a [`Next`] continuation. Calling `next.run(ctx)` hands a
//! new context to the following middleware; not calling it ends the chain
//! and the context the middleware returns becomes the final one. Middleware
//! run one after another, in registration order, never concurrently.
//!
//! ```rust
//! use ferrous_modular::middleware::{middleware, Chain};
//! use serde_json::{json, Value};
//!
//! let tag = middleware(|args, next| async move {
//!     let mut ctx: Value = args.ctx;
//!     ctx["tenant"] = json!("acme");
//!     next.run(ctx).await
//! });
//! let chain = Chain::new(vec![tag]);
//! assert_eq!(chain.len(), 1);
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::context::RequestContext;
use crate::descriptors::ServiceDeps;
use crate::error::ModularError;
use crate::provider::ServiceContainer;
use crate::route_error::RouteFailure;
use crate::worker::{QueueContainer, WorkerContainer};

/// What a middleware is called with.
pub struct MiddlewareArgs<C> {
    /// Context handed over by the previous step
    pub ctx: C,
    pub services: ServiceContainer,
    pub workers: WorkerContainer,
    pub queues: QueueContainer,
    /// Request and reply handles of the current request
    pub request: RequestContext,
}

/// Type-erased middleware.
pub type Middleware<C> = Arc<dyn Fn(MiddlewareArgs<C>, Next<C>) -> BoxFuture<'static, Result<C, RouteFailure>> + Send + Sync>;

/// Erases a middleware closure.
pub fn middleware<C, F, Fut>(f: F) -> Middleware<C>
where
    C: Send + 'static,
    F: Fn(MiddlewareArgs<C>, Next<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, RouteFailure>> + Send + 'static,
{
    Arc::new(move |args: MiddlewareArgs<C>, next: Next<C>| f(args, next).boxed())
}

struct Progress<C> {
    index: Option<usize>,
    latest: C,
}

struct Run<C> {
    middlewares: Arc<[Middleware<C>]>,
    deps: ServiceDeps,
    request: RequestContext,
    progress: Mutex<Progress<C>>,
}

/// Continuation handed to a middleware. Valid for a single call.
pub struct Next<C> {
    run: Arc<Run<C>>,
    position: usize,
}

impl<C> Next<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Hands `ctx` to the rest of the chain and returns the context the
    /// chain finished with.
    ///
    /// # Errors
    ///
    /// `DoubleNext` when called a second time, or whatever a later
    /// middleware fails with.
    pub async fn run(&self, ctx: C) -> Result<C, RouteFailure> {
        dispatch(Arc::clone(&self.run), self.position, ctx).await?;
        Ok(self.run.progress.lock().latest.clone())
    }
}

fn dispatch<C>(run: Arc<Run<C>>, position: usize, ctx: C) -> BoxFuture<'static, Result<(), RouteFailure>>
where
    C: Clone + Send + Sync + 'static,
{
    async move {
        {
            let mut progress = run.progress.lock();
            if progress.index.map_or(false, |index| position <= index) {
                return Err(ModularError::DoubleNext.into());
            }
            progress.index = Some(position);
            progress.latest = ctx.clone();
        }

        let Some(middleware) = run.middlewares.get(position).cloned() else {
            return Ok(());
        };
        let args = MiddlewareArgs {
            ctx,
            services: run.deps.services.clone(),
            workers: run.deps.workers.clone(),
            queues: run.deps.queues.clone(),
            request: run.request.clone(),
        };
        let next = Next {
            run: Arc::clone(&run),
            position: position + 1,
        };
        let returned = middleware(args, next).await?;

        // Short-circuited: nothing downstream ran, so this middleware has the last word.
        let mut progress = run.progress.lock();
        if progress.index == Some(position) {
            progress.latest = returned;
        }
        Ok(())
    }
    .boxed()
}

/// An ordered list of middleware, composed once and run per request.
pub struct Chain<C> {
    middlewares: Arc<[Middleware<C>]>,
}

impl<C> Clone for Chain<C> {
    fn clone(&self) -> Self {
        Self {
            middlewares: Arc::clone(&self.middlewares),
        }
    }
}

impl<C> Chain<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(middlewares: Vec<Middleware<C>>) -> Self {
        Self {
            middlewares: Arc::from(middlewares),
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs the chain from `initial` and returns the final context.
    pub async fn run(&self, initial: C, deps: ServiceDeps, request: RequestContext) -> Result<C, RouteFailure> {
        let run = Arc::new(Run {
            middlewares: Arc::clone(&self.middlewares),
            deps,
            request,
            progress: Mutex::new(Progress {
                index: None,
                latest: initial.clone(),
            }),
        });
        dispatch(Arc::clone(&run), 0, initial).await?;
        let latest = run.progress.lock().latest.clone();
        Ok(latest)
    }
}

/// Composes `middlewares` into a chain, preserving order.
pub fn compose<C>(middlewares: Vec<Middleware<C>>) -> Chain<C>
where
    C: Clone + Send + Sync + 'static,
{
    Chain::new(middlewares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Reply, RequestHead};
    use crate::registration::ServiceRegistry;
    use axum::http::Request;
    use serde_json::{json, Value};

    fn request() -> (ServiceDeps, RequestContext) {
        let (parts, _) = Request::new(()).into_parts();
        let ctx = RequestContext::new(RequestHead::from_parts(&parts), Reply::new());
        let deps = ServiceRegistry::new().resolve_for_request(ctx.clone()).deps();
        (deps, ctx)
    }

    #[tokio::test]
    async fn empty_chain_returns_initial_context() {
        let (deps, ctx) = request();
        let chain: Chain<Value> = Chain::new(Vec::new());
        assert_eq!(chain.run(json!({ "x": 1 }), deps, ctx).await.unwrap(), json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn middleware_sees_request_handles() {
        let (deps, ctx) = request();
        let chain = Chain::new(vec![middleware(|args: MiddlewareArgs<Value>, next: Next<Value>| async move {
            let method = args.request.request().method.to_string();
            next.run(json!({ "method": method })).await
        })]);
        assert_eq!(chain.run(json!({}), deps, ctx).await.unwrap(), json!({ "method": "GET" }));
    }

    #[tokio::test]
    async fn errors_stop_the_chain() {
        let (deps, ctx) = request();
        let reached = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&reached);
        let chain = Chain::new(vec![
            middleware(|_: MiddlewareArgs<Value>, _: Next<Value>| async {
                Err::<Value, RouteFailure>(crate::route_error::GenericRouteError::unauthorized("no token").into())
            }),
            middleware(move |args: MiddlewareArgs<Value>, next: Next<Value>| {
                let flag = Arc::clone(&flag);
                async move {
                    *flag.lock() = true;
                    next.run(args.ctx).await
                }
            }),
        ]);
        let failure = chain.run(json!({}), deps, ctx).await.unwrap_err();
        assert_eq!(failure.status(), crate::route_error::ErrorStatus::Unauthorized);
        assert!(!*reached.lock());
    }
}
