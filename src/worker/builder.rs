//! Stage-typed worker builder.
//!
//! `queue(..)` opens a draft, `options`/`on`/`once`/`upsert_job_scheduler`
//! refine it, `connection(..)` closes it to everything but the processor, and
//! `processor(..)` or `sandboxed(..)` yields the finished [`WorkerDescriptor`].
//! `options` can be called at most once; the stage types make a second call a
//! compile error.
//!
//! ```rust
//! use ferrous_modular::worker::{self, ConnectionOptions, RepeatOptions, WorkerEventKind};
//!
//! let mail = worker::queue("mail")
//!     .upsert_job_scheduler("digest", RepeatOptions::every(60_000), Default::default())
//!     .on(WorkerEventKind::Failed, |_deps, event| async move {
//!         tracing::warn!(error = ?event.error, "mail job failed");
//!         Ok(())
//!     })
//!     .connection(ConnectionOptions::default())
//!     .processor(|job, _deps| async move { Ok(job.name.len()) });
//!
//! assert_eq!(mail.queue_name(), "mail");
//! assert_eq!(mail.schedulers().len(), 1);
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::descriptors::ServiceDeps;
use crate::error::BoxError;

use super::engine::{
    ConnectionOptions, Job, JobScheduler, JobTemplate, QueueOptions, RepeatOptions, WorkerEvent,
    WorkerEventKind, WorkerOptions,
};

/// User processor: receives the job and a fresh lookup surface per invocation.
pub type JobProcessor = Arc<dyn Fn(Job, ServiceDeps) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// User event listener, fed the same lookup surface as processors.
pub type WorkerListener = Arc<dyn Fn(ServiceDeps, WorkerEvent) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum ProcessorSource {
    Inline(JobProcessor),
    Sandboxed(String),
}

/// Everything needed to create one queue and its worker.
///
/// Consumed by [`WorkerRegistry::register`](crate::WorkerRegistry::register).
#[derive(Clone)]
pub struct WorkerDescriptor {
    pub(crate) queue_name: String,
    pub(crate) queue_options: QueueOptions,
    pub(crate) worker_options: WorkerOptions,
    pub(crate) connection: ConnectionOptions,
    pub(crate) processor: ProcessorSource,
    pub(crate) schedulers: Vec<JobScheduler>,
    pub(crate) on_handlers: Vec<(WorkerEventKind, WorkerListener)>,
    pub(crate) once_handlers: Vec<(WorkerEventKind, WorkerListener)>,
}

impl WorkerDescriptor {
    /// Queue name, also the key for `workers.get` / `queues.get`.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn queue_options(&self) -> &QueueOptions {
        &self.queue_options
    }

    pub fn worker_options(&self) -> &WorkerOptions {
        &self.worker_options
    }

    pub fn connection(&self) -> &ConnectionOptions {
        &self.connection
    }

    /// Schedulers in declaration order.
    pub fn schedulers(&self) -> &[JobScheduler] {
        &self.schedulers
    }

    pub fn is_sandboxed(&self) -> bool {
        matches!(self.processor, ProcessorSource::Sandboxed(_))
    }

    /// Number of `on` and `once` listeners.
    pub fn listener_count(&self) -> usize {
        self.on_handlers.len() + self.once_handlers.len()
    }
}

impl std::fmt::Debug for WorkerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDescriptor")
            .field("queue_name", &self.queue_name)
            .field("sandboxed", &self.is_sandboxed())
            .field("schedulers", &self.schedulers.len())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Draft stage marker: worker options not set yet.
pub struct NoOptions;
/// Draft stage marker: worker options already set.
pub struct HasOptions;

struct Draft {
    queue_name: String,
    queue_options: QueueOptions,
    worker_options: WorkerOptions,
    schedulers: Vec<JobScheduler>,
    on_handlers: Vec<(WorkerEventKind, WorkerListener)>,
    once_handlers: Vec<(WorkerEventKind, WorkerListener)>,
}

/// Worker under construction.
pub struct WorkerDraft<S> {
    draft: Draft,
    _stage: PhantomData<S>,
}

/// Starts a worker for `queue_name` with default queue options.
pub fn queue(queue_name: impl Into<String>) -> WorkerDraft<NoOptions> {
    queue_with(queue_name, QueueOptions::default())
}

/// Starts a worker for `queue_name`.
pub fn queue_with(queue_name: impl Into<String>, queue_options: QueueOptions) -> WorkerDraft<NoOptions> {
    WorkerDraft {
        draft: Draft {
            queue_name: queue_name.into(),
            queue_options,
            worker_options: WorkerOptions::default(),
            schedulers: Vec::new(),
            on_handlers: Vec::new(),
            once_handlers: Vec::new(),
        },
        _stage: PhantomData,
    }
}

fn erase_listener<F, Fut>(listener: F) -> WorkerListener
where
    F: Fn(ServiceDeps, WorkerEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |deps: ServiceDeps, event: WorkerEvent| listener(deps, event).boxed())
}

impl WorkerDraft<NoOptions> {
    /// Sets worker options (concurrency and engine-specific settings).
    pub fn options(self, options: WorkerOptions) -> WorkerDraft<HasOptions> {
        let mut draft = self.draft;
        draft.worker_options = options;
        WorkerDraft {
            draft,
            _stage: PhantomData,
        }
    }
}

impl<S> WorkerDraft<S> {
    /// Adds a listener for every occurrence of `event`.
    pub fn on<F, Fut>(mut self, event: WorkerEventKind, listener: F) -> Self
    where
        F: Fn(ServiceDeps, WorkerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.draft.on_handlers.push((event, erase_listener(listener)));
        self
    }

    /// Adds a listener for the next occurrence of `event`.
    pub fn once<F, Fut>(mut self, event: WorkerEventKind, listener: F) -> Self
    where
        F: Fn(ServiceDeps, WorkerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.draft.once_handlers.push((event, erase_listener(listener)));
        self
    }

    /// Declares a recurring job; applied to the queue at registration.
    pub fn upsert_job_scheduler(mut self, id: impl Into<String>, repeat: RepeatOptions, template: JobTemplate) -> Self {
        self.draft.schedulers.push(JobScheduler {
            id: id.into(),
            repeat,
            template,
        });
        self
    }

    /// Sets the engine connection. Only the processor remains after this.
    pub fn connection(self, connection: ConnectionOptions) -> WorkerConnected {
        WorkerConnected {
            draft: self.draft,
            connection,
        }
    }
}

/// Final stage: pick the processor.
pub struct WorkerConnected {
    draft: Draft,
    connection: ConnectionOptions,
}

impl WorkerConnected {
    /// Runs `processor` in-process for every job. Its output is serialized
    /// as the job result.
    pub fn processor<R, F, Fut>(self, processor: F) -> WorkerDescriptor
    where
        R: Serialize + Send + 'static,
        F: Fn(Job, ServiceDeps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
    {
        let erased: JobProcessor = Arc::new(move |job: Job, deps: ServiceDeps| {
            processor(job, deps)
                .map(|result| result.and_then(|value| serde_json::to_value(value).map_err(BoxError::from)))
                .boxed()
        });
        self.finish(ProcessorSource::Inline(erased))
    }

    /// Hands a script path to the engine, which runs it in a sandbox.
    pub fn sandboxed(self, path: impl Into<String>) -> WorkerDescriptor {
        self.finish(ProcessorSource::Sandboxed(path.into()))
    }

    fn finish(self, processor: ProcessorSource) -> WorkerDescriptor {
        let Draft {
            queue_name,
            queue_options,
            worker_options,
            schedulers,
            on_handlers,
            once_handlers,
        } = self.draft;
        WorkerDescriptor {
            queue_name,
            queue_options,
            worker_options,
            connection: self.connection,
            processor,
            schedulers,
            on_handlers,
            once_handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_and_handlers_are_recorded_in_order() {
        let descriptor = queue("reports")
            .upsert_job_scheduler("hourly", RepeatOptions::every(3_600_000), JobTemplate::default())
            .options(WorkerOptions {
                concurrency: 3,
                ..WorkerOptions::default()
            })
            .once(WorkerEventKind::Drained, |_, _| async { Ok(()) })
            .on(WorkerEventKind::Completed, |_, _| async { Ok(()) })
            .upsert_job_scheduler("nightly", RepeatOptions::cron("0 0 * * *"), JobTemplate::default())
            .connection(ConnectionOptions::default())
            .processor(|_, _| async { Ok(()) });

        let ids: Vec<_> = descriptor.schedulers().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["hourly", "nightly"]);
        assert_eq!(descriptor.worker_options().concurrency, 3);
        assert_eq!(descriptor.listener_count(), 2);
        assert!(!descriptor.is_sandboxed());
    }

    #[test]
    fn sandboxed_keeps_script_path() {
        let descriptor = queue("thumbnails")
            .connection(ConnectionOptions::default())
            .sandboxed("./processors/thumbnail.js");
        assert!(descriptor.is_sandboxed());
        assert!(matches!(
            descriptor.processor,
            ProcessorSource::Sandboxed(ref path) if path == "./processors/thumbnail.js"
        ));
    }
}
