//! Worker registry: queues and workers keyed by queue name.
//!
//! Registration creates the queue paused, applies its job schedulers in
//! declaration order and then starts the worker. Queues only start handing
//! out jobs once [`WorkerRegistry::resume_queues`] runs, after every worker
//! has been registered, so a processor enqueuing onto another queue never
//! races that queue's own setup.

use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{error, info};

use crate::error::{ModularError, ModularResult, RegistryKind};
use crate::registration::ServiceRegistry;

pub mod builder;
pub mod engine;
#[cfg(feature = "memory-engine")]
pub mod memory;

pub use builder::{
    queue, queue_with, HasOptions, JobProcessor, NoOptions, WorkerConnected, WorkerDescriptor, WorkerDraft,
    WorkerListener,
};
pub use engine::{
    ConnectionOptions, EventListener, Job, JobOptions, JobScheduler, JobTemplate, Processor, ProcessorFn,
    QueueEngine, QueueHandle, QueueOptions, RepeatOptions, WorkerEvent, WorkerEventKind, WorkerHandle,
    WorkerOptions,
};

use builder::ProcessorSource;

/// Live queue and worker handles, shared by the worker registry and every
/// container handed out by the service registry.
#[derive(Default)]
pub(crate) struct WorkerTables {
    queues: RwLock<Vec<Arc<dyn QueueHandle>>>,
    workers: RwLock<Vec<Arc<dyn WorkerHandle>>>,
}

impl WorkerTables {
    fn has_queue(&self, name: &str) -> bool {
        self.queues.read().iter().any(|queue| queue.name() == name)
    }

    fn has_worker(&self, name: &str) -> bool {
        self.workers.read().iter().any(|worker| worker.queue_name() == name)
    }

    fn insert_queue(&self, queue: Arc<dyn QueueHandle>) -> ModularResult<()> {
        let mut queues = self.queues.write();
        if queues.iter().any(|existing| existing.name() == queue.name()) {
            return Err(ModularError::duplicate(RegistryKind::Queue, queue.name()));
        }
        queues.push(queue);
        Ok(())
    }

    fn insert_worker(&self, worker: Arc<dyn WorkerHandle>) -> ModularResult<()> {
        let mut workers = self.workers.write();
        if workers.iter().any(|existing| existing.queue_name() == worker.queue_name()) {
            return Err(ModularError::duplicate(RegistryKind::Worker, worker.queue_name()));
        }
        workers.push(worker);
        Ok(())
    }

    fn queue(&self, name: &str) -> ModularResult<Arc<dyn QueueHandle>> {
        self.queues
            .read()
            .iter()
            .find(|queue| queue.name() == name)
            .cloned()
            .ok_or_else(|| ModularError::not_found(RegistryKind::Queue, name))
    }

    fn worker(&self, name: &str) -> ModularResult<Arc<dyn WorkerHandle>> {
        self.workers
            .read()
            .iter()
            .find(|worker| worker.queue_name() == name)
            .cloned()
            .ok_or_else(|| ModularError::not_found(RegistryKind::Worker, name))
    }

    fn all_queues(&self) -> Vec<Arc<dyn QueueHandle>> {
        self.queues.read().clone()
    }

    fn all_workers(&self) -> Vec<Arc<dyn WorkerHandle>> {
        self.workers.read().clone()
    }
}

/// Worker lookup by queue name.
#[derive(Clone)]
pub struct WorkerContainer {
    tables: Arc<WorkerTables>,
}

impl WorkerContainer {
    pub(crate) fn new(tables: Arc<WorkerTables>) -> Self {
        Self { tables }
    }

    /// # Errors
    ///
    /// `NotFound` if no worker consumes `name`.
    pub fn get(&self, name: &str) -> ModularResult<Arc<dyn WorkerHandle>> {
        self.tables.worker(name)
    }

    /// Queue names that have a worker, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tables
            .all_workers()
            .iter()
            .map(|worker| worker.queue_name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for WorkerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContainer").field("workers", &self.names()).finish()
    }
}

/// Queue lookup by name.
#[derive(Clone)]
pub struct QueueContainer {
    tables: Arc<WorkerTables>,
}

impl QueueContainer {
    pub(crate) fn new(tables: Arc<WorkerTables>) -> Self {
        Self { tables }
    }

    /// # Errors
    ///
    /// `NotFound` if no queue is registered under `name`.
    pub fn get(&self, name: &str) -> ModularResult<Arc<dyn QueueHandle>> {
        self.tables.queue(name)
    }

    /// Registered queue names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tables
            .all_queues()
            .iter()
            .map(|queue| queue.name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for QueueContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueContainer").field("queues", &self.names()).finish()
    }
}

/// How much of a descriptor to bring up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterMode {
    /// Queue, schedulers and worker
    #[default]
    Full,
    /// Queue and schedulers only, for processes that only produce jobs
    QueueOnly,
}

/// Creates queues and workers through a [`QueueEngine`] and binds them to a
/// [`ServiceRegistry`].
///
/// # Examples
///
/// ```rust
/// # #[cfg(feature = "memory-engine")]
/// # async fn example() -> Result<(), ferrous_modular::ModularError> {
/// use std::sync::Arc;
/// use ferrous_modular::worker::{self, memory::MemoryEngine, ConnectionOptions};
/// use ferrous_modular::{ServiceRegistry, WorkerRegistry};
///
/// let services = ServiceRegistry::new();
/// let workers = WorkerRegistry::new(services.clone(), Arc::new(MemoryEngine::new()));
///
/// let mail = worker::queue("mail")
///     .connection(ConnectionOptions::default())
///     .processor(|job, _deps| async move { Ok(job.id) });
/// workers.register(mail).await?;
/// workers.resume_queues().await?;
///
/// assert_eq!(workers.get_queue("mail")?.name(), "mail");
/// assert!(workers.get_worker("sms").is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WorkerRegistry {
    services: ServiceRegistry,
    engine: Arc<dyn QueueEngine>,
    tables: Arc<WorkerTables>,
}

impl WorkerRegistry {
    /// Creates a registry whose queues and workers are visible through
    /// `services`' containers.
    pub fn new(services: ServiceRegistry, engine: Arc<dyn QueueEngine>) -> Self {
        let tables = services.worker_tables();
        Self {
            services,
            engine,
            tables,
        }
    }

    /// Creates the queue (paused), its schedulers and its worker.
    ///
    /// # Errors
    ///
    /// `DuplicateRegistration` if the queue name is taken, or `Queue` if the
    /// engine fails. The failure is logged; queues registered before stay
    /// usable.
    pub async fn register(&self, descriptor: WorkerDescriptor) -> ModularResult<()> {
        self.register_with(descriptor, RegisterMode::Full).await
    }

    /// Like [`register`](Self::register), optionally without the worker.
    pub async fn register_with(&self, descriptor: WorkerDescriptor, mode: RegisterMode) -> ModularResult<()> {
        let queue_name = descriptor.queue_name.clone();
        let result = self.try_register(descriptor, mode).await;
        if let Err(err) = &result {
            error!(queue = %queue_name, error = %err, "There was an error while registering the worker.");
        }
        result
    }

    async fn try_register(&self, descriptor: WorkerDescriptor, mode: RegisterMode) -> ModularResult<()> {
        let WorkerDescriptor {
            queue_name,
            queue_options,
            worker_options,
            connection,
            processor,
            schedulers,
            on_handlers,
            once_handlers,
        } = descriptor;
        let engine_error = |source| ModularError::Queue {
            queue: queue_name.clone(),
            source,
        };

        if self.tables.has_queue(&queue_name) {
            return Err(ModularError::duplicate(RegistryKind::Queue, &queue_name));
        }

        let queue = self
            .engine
            .create_queue(&queue_name, &queue_options, &connection)
            .await
            .map_err(engine_error)?;
        queue.pause().await.map_err(engine_error)?;
        self.tables.insert_queue(Arc::clone(&queue))?;
        info!(queue = %queue_name, "registered queue (paused)");

        for scheduler in schedulers {
            let id = scheduler.id.clone();
            queue.upsert_job_scheduler(scheduler).await.map_err(engine_error)?;
            info!(queue = %queue_name, scheduler = %id, "upserted job scheduler");
        }

        if mode == RegisterMode::QueueOnly {
            return Ok(());
        }

        if self.tables.has_worker(&queue_name) {
            return Err(ModularError::duplicate(RegistryKind::Worker, &queue_name));
        }

        let processor = match processor {
            ProcessorSource::Inline(user) => Processor::Inline(self.bind_processor(&queue_name, user)),
            ProcessorSource::Sandboxed(path) => Processor::Sandboxed(path),
        };
        let worker = self
            .engine
            .create_worker(&queue_name, processor, &worker_options, &connection)
            .await
            .map_err(engine_error)?;

        for (event, listener) in on_handlers {
            worker.on(event, self.bind_listener(&queue_name, "on", event, listener));
        }
        for (event, listener) in once_handlers {
            worker.once(event, self.bind_listener(&queue_name, "once", event, listener));
        }

        self.tables.insert_worker(worker)?;
        info!(queue = %queue_name, concurrency = worker_options.concurrency, "registered worker");
        Ok(())
    }

    /// Every invocation gets a fresh resolution session. Failures are logged
    /// and handed back to the engine, whose retry policy applies.
    fn bind_processor(&self, queue_name: &str, user: JobProcessor) -> ProcessorFn {
        let services = self.services.clone();
        let queue_name: Arc<str> = Arc::from(queue_name);
        Arc::new(move |job: Job| {
            let deps = services.resolve().deps();
            let user = Arc::clone(&user);
            let queue_name = Arc::clone(&queue_name);
            async move {
                let job_id = job.id.clone();
                user(job, deps).await.map_err(|err| {
                    error!(queue = %queue_name, job = %job_id, error = %err, "Error in processor.");
                    err
                })
            }
            .boxed()
        })
    }

    /// Listener failures are logged and swallowed.
    fn bind_listener(
        &self,
        queue_name: &str,
        kind: &'static str,
        event: WorkerEventKind,
        listener: WorkerListener,
    ) -> EventListener {
        let services = self.services.clone();
        let queue_name: Arc<str> = Arc::from(queue_name);
        Arc::new(move |payload: WorkerEvent| {
            let deps = services.resolve().deps();
            let listener = Arc::clone(&listener);
            let queue_name = Arc::clone(&queue_name);
            async move {
                if let Err(err) = listener(deps, payload).await {
                    error!(queue = %queue_name, %event, error = %err, "Error in worker {kind} \"{event}\" handler.");
                }
            }
            .boxed()
        })
    }

    /// # Errors
    ///
    /// `NotFound` if no queue is registered under `name`.
    pub fn get_queue(&self, name: &str) -> ModularResult<Arc<dyn QueueHandle>> {
        self.tables.queue(name)
    }

    /// # Errors
    ///
    /// `NotFound` if no worker consumes `name`.
    pub fn get_worker(&self, name: &str) -> ModularResult<Arc<dyn WorkerHandle>> {
        self.tables.worker(name)
    }

    /// Resumes every registered queue, in registration order.
    pub async fn resume_queues(&self) -> ModularResult<()> {
        for queue in self.tables.all_queues() {
            queue.resume().await.map_err(|source| ModularError::Queue {
                queue: queue.name().to_string(),
                source,
            })?;
            info!(queue = %queue.name(), "resumed queue");
        }
        Ok(())
    }

    /// Closes every worker, then every queue.
    ///
    /// Keeps going past failures and returns the first one.
    pub async fn close_all(&self) -> ModularResult<()> {
        let mut first_error = None;
        for worker in self.tables.all_workers() {
            if let Err(source) = worker.close().await {
                error!(queue = %worker.queue_name(), error = %source, "failed to close worker");
                first_error.get_or_insert(ModularError::Queue {
                    queue: worker.queue_name().to_string(),
                    source,
                });
            }
        }
        for queue in self.tables.all_queues() {
            if let Err(source) = queue.close().await {
                error!(queue = %queue.name(), error = %source, "failed to close queue");
                first_error.get_or_insert(ModularError::Queue {
                    queue: queue.name().to_string(),
                    source,
                });
            }
        }
        info!("closed all workers and queues");
        first_error.map_or(Ok(()), Err)
    }

    /// Queue lookup surface, as handed to factories and handlers.
    pub fn queues(&self) -> QueueContainer {
        QueueContainer::new(Arc::clone(&self.tables))
    }

    /// Worker lookup surface, as handed to factories and handlers.
    pub fn workers(&self) -> WorkerContainer {
        WorkerContainer::new(Arc::clone(&self.tables))
    }

    /// The service registry processors resolve from.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("queues", &self.queues().names())
            .field("workers", &self.workers().names())
            .finish()
    }
}
