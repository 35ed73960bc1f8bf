//! In-process queue engine on top of tokio.
//!
//! Meant for development and tests: jobs live in memory, nothing survives a
//! restart and failed jobs are recorded but never retried. Pause/resume,
//! worker concurrency, delayed jobs, priorities and interval schedulers
//! behave the way a real engine's would, which is enough to exercise a
//! [`WorkerRegistry`](crate::WorkerRegistry) end to end.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cancellation::CancellationToken;
use crate::error::BoxError;

use super::engine::{
    ConnectionOptions, EventListener, Job, JobOptions, JobScheduler, Processor, ProcessorFn, QueueEngine,
    QueueHandle, QueueOptions, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerOptions,
};

/// A job whose processor returned an error.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub job: Job,
    pub error: String,
}

struct QueueState {
    name: String,
    options: QueueOptions,
    waiting: Mutex<VecDeque<Job>>,
    available: Notify,
    paused: watch::Sender<bool>,
    closed: CancellationToken,
    next_job: AtomicU64,
    schedulers: Mutex<HashMap<String, JoinHandle<()>>>,
    completed: Mutex<Vec<(Job, Value)>>,
    failed: Mutex<Vec<FailedJob>>,
}

impl QueueState {
    fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            waiting: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            paused: watch::channel(false).0,
            closed: CancellationToken::new(),
            next_job: AtomicU64::new(1),
            schedulers: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
        }
    }

    fn new_job(&self, name: &str, data: Value, options: JobOptions) -> Job {
        let defaults = &self.options.default_job_options;
        let options = JobOptions {
            job_id: options.job_id,
            delay_ms: options.delay_ms.or(defaults.delay_ms),
            attempts: options.attempts.or(defaults.attempts),
            priority: options.priority.or(defaults.priority),
        };
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| self.next_job.fetch_add(1, Ordering::Relaxed).to_string());
        Job {
            id,
            name: name.to_string(),
            queue: self.name.clone(),
            data,
            options,
            attempts_made: 0,
            timestamp: Utc::now(),
        }
    }

    /// Lower priority values go first; equal priorities keep arrival order.
    fn push(&self, job: Job) {
        {
            let mut waiting = self.waiting.lock();
            let rank = job.options.priority.unwrap_or(0);
            let at = waiting
                .iter()
                .position(|queued| queued.options.priority.unwrap_or(0) > rank)
                .unwrap_or(waiting.len());
            waiting.insert(at, job);
        }
        self.available.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        self.waiting.lock().pop_front()
    }
}

fn enqueue(state: &Arc<QueueState>, job: Job) {
    match job.options.delay_ms.filter(|delay| *delay > 0) {
        Some(delay) => {
            let weak = Arc::downgrade(state);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if let Some(state) = weak.upgrade() {
                    state.push(job);
                }
            });
        }
        None => state.push(job),
    }
}

fn spawn_scheduler(weak: Weak<QueueState>, scheduler: JobScheduler, every_ms: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(every_ms);
        let start = if scheduler.repeat.immediately {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut ticker = tokio::time::interval_at(start, period);
        let name = scheduler.template.name.clone().unwrap_or_else(|| scheduler.id.clone());
        let mut produced: u32 = 0;
        loop {
            ticker.tick().await;
            let Some(state) = weak.upgrade() else { break };
            if state.closed.is_cancelled() {
                break;
            }
            produced += 1;
            let options = JobOptions {
                job_id: Some(format!("repeat:{}:{produced}", scheduler.id)),
                ..scheduler.template.opts.clone().unwrap_or_default()
            };
            let data = scheduler.template.data.clone().unwrap_or(Value::Null);
            let job = state.new_job(&name, data, options);
            trace!(queue = %state.name, scheduler = %scheduler.id, job = %job.id, "scheduler produced job");
            enqueue(&state, job);
            if scheduler.repeat.limit.map_or(false, |limit| produced >= limit) {
                break;
            }
        }
    })
}

/// Handle to an in-memory queue.
///
/// Besides the [`QueueHandle`] contract it exposes the queue's bookkeeping,
/// reachable through `queue.as_any().downcast_ref::<MemoryQueue>()`.
#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<QueueState>,
}

impl MemoryQueue {
    /// Jobs waiting to be picked up.
    pub fn waiting_count(&self) -> usize {
        self.state.waiting.lock().len()
    }

    /// Jobs processed successfully, with their results.
    pub fn completed(&self) -> Vec<(Job, Value)> {
        self.state.completed.lock().clone()
    }

    /// Jobs whose processor failed.
    pub fn failed(&self) -> Vec<FailedJob> {
        self.state.failed.lock().clone()
    }

    /// Ids of the active job schedulers, sorted.
    pub fn scheduler_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.schedulers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl QueueHandle for MemoryQueue {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn pause(&self) -> Result<(), BoxError> {
        self.state.paused.send_replace(true);
        debug!(queue = %self.state.name, "queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), BoxError> {
        self.state.paused.send_replace(false);
        debug!(queue = %self.state.name, "queue resumed");
        Ok(())
    }

    fn is_paused(&self) -> bool {
        *self.state.paused.borrow()
    }

    async fn upsert_job_scheduler(&self, scheduler: JobScheduler) -> Result<(), BoxError> {
        let every_ms = match scheduler.repeat.every_ms {
            Some(every) if every > 0 => every,
            Some(_) => return Err("scheduler interval must be positive".into()),
            None => {
                return Err(format!(
                    "scheduler \"{}\": the in-memory engine only supports `every` intervals",
                    scheduler.id
                )
                .into())
            }
        };
        let id = scheduler.id.clone();
        let task = spawn_scheduler(Arc::downgrade(&self.state), scheduler, every_ms);
        if let Some(previous) = self.state.schedulers.lock().insert(id, task) {
            previous.abort();
        }
        Ok(())
    }

    async fn add(&self, name: &str, data: Value, options: JobOptions) -> Result<Job, BoxError> {
        if self.state.closed.is_cancelled() {
            return Err(format!("queue \"{}\" is closed", self.state.name).into());
        }
        let job = self.state.new_job(name, data, options);
        enqueue(&self.state, job.clone());
        Ok(job)
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.state.closed.cancel();
        for (_, task) in self.state.schedulers.lock().drain() {
            task.abort();
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Subscription {
    event: WorkerEventKind,
    listener: EventListener,
    once: bool,
}

struct WorkerShared {
    queue: Arc<QueueState>,
    processor: ProcessorFn,
    concurrency: usize,
    listeners: Mutex<Vec<Subscription>>,
    closing: CancellationToken,
    running: AtomicBool,
}

impl WorkerShared {
    /// Runs the matching listeners, in subscription order, on a task of their own.
    fn emit(&self, event: WorkerEvent) -> Option<JoinHandle<()>> {
        let matched: Vec<EventListener> = {
            let mut listeners = self.listeners.lock();
            let mut matched = Vec::new();
            listeners.retain(|subscription| {
                if subscription.event != event.kind {
                    return true;
                }
                matched.push(Arc::clone(&subscription.listener));
                !subscription.once
            });
            matched
        };
        if matched.is_empty() {
            return None;
        }
        Some(tokio::spawn(async move {
            for listener in matched {
                listener(event.clone()).await;
            }
        }))
    }

    fn stopping(&self) -> bool {
        self.closing.is_cancelled() || self.queue.closed.is_cancelled()
    }
}

async fn run_worker(shared: Arc<WorkerShared>) {
    let permits = Arc::new(Semaphore::new(shared.concurrency));
    let mut paused = shared.queue.paused.subscribe();
    let mut was_paused = *paused.borrow_and_update();
    let mut busy = false;

    loop {
        if shared.stopping() {
            break;
        }

        let is_paused = *paused.borrow_and_update();
        if is_paused != was_paused {
            let kind = if is_paused {
                WorkerEventKind::Paused
            } else {
                WorkerEventKind::Resumed
            };
            shared.emit(WorkerEvent::new(kind));
            was_paused = is_paused;
        }
        if is_paused {
            tokio::select! {
                _ = paused.changed() => {}
                _ = shared.closing.cancelled() => break,
                _ = shared.queue.closed.cancelled() => break,
            }
            continue;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shared.closing.cancelled() => break,
        };

        match shared.queue.pop() {
            Some(job) => {
                busy = true;
                tokio::spawn(process_job(Arc::clone(&shared), job, permit));
            }
            None => {
                drop(permit);
                if busy {
                    busy = false;
                    shared.emit(WorkerEvent::new(WorkerEventKind::Drained));
                }
                tokio::select! {
                    _ = shared.queue.available.notified() => {}
                    _ = paused.changed() => {}
                    _ = shared.closing.cancelled() => break,
                    _ = shared.queue.closed.cancelled() => break,
                }
            }
        }
    }

    // Wait for jobs still in progress.
    let _ = permits.acquire_many(shared.concurrency as u32).await;
    shared.running.store(false, Ordering::Release);
}

async fn process_job(shared: Arc<WorkerShared>, mut job: Job, permit: tokio::sync::OwnedSemaphorePermit) {
    let _permit = permit;
    job.attempts_made += 1;
    shared.emit(WorkerEvent::new(WorkerEventKind::Active).with_job(job.clone()));

    match (shared.processor)(job.clone()).await {
        Ok(result) => {
            shared.queue.completed.lock().push((job.clone(), result.clone()));
            shared.emit(
                WorkerEvent::new(WorkerEventKind::Completed)
                    .with_job(job)
                    .with_result(result),
            );
        }
        Err(err) => {
            let error = err.to_string();
            shared.queue.failed.lock().push(FailedJob {
                job: job.clone(),
                error: error.clone(),
            });
            shared.emit(WorkerEvent::new(WorkerEventKind::Failed).with_job(job).with_error(error));
        }
    }
}

/// Handle to an in-memory worker. Dropping the last handle stops it.
pub struct MemoryWorker {
    shared: Arc<WorkerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl WorkerHandle for MemoryWorker {
    fn queue_name(&self) -> &str {
        &self.shared.queue.name
    }

    fn on(&self, event: WorkerEventKind, listener: EventListener) {
        self.shared.listeners.lock().push(Subscription {
            event,
            listener,
            once: false,
        });
    }

    fn once(&self, event: WorkerEventKind, listener: EventListener) {
        self.shared.listeners.lock().push(Subscription {
            event,
            listener,
            once: true,
        });
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.shared.closing.cancel_with_reason("worker closed");
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await?;
            if let Some(listeners) = self.shared.emit(WorkerEvent::new(WorkerEventKind::Closed)) {
                listeners.await?;
            }
            debug!(queue = %self.shared.queue.name, "worker closed");
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MemoryWorker {
    fn drop(&mut self) {
        self.shared.closing.cancel();
    }
}

/// The in-memory [`QueueEngine`].
///
/// Queues are keyed by name: creating a queue that already exists attaches
/// to it, and a worker consumes whichever queue carries its name.
#[derive(Default)]
pub struct MemoryEngine {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, name: &str, options: &QueueOptions) -> Arc<QueueState> {
        let mut queues = self.queues.lock();
        Arc::clone(
            queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(QueueState::new(name, options.clone()))),
        )
    }
}

#[async_trait]
impl QueueEngine for MemoryEngine {
    async fn create_queue(
        &self,
        name: &str,
        options: &QueueOptions,
        _connection: &ConnectionOptions,
    ) -> Result<Arc<dyn QueueHandle>, BoxError> {
        Ok(Arc::new(MemoryQueue {
            state: self.state(name, options),
        }))
    }

    async fn create_worker(
        &self,
        queue: &str,
        processor: Processor,
        options: &WorkerOptions,
        _connection: &ConnectionOptions,
    ) -> Result<Arc<dyn WorkerHandle>, BoxError> {
        let processor = match processor {
            Processor::Inline(processor) => processor,
            Processor::Sandboxed(path) => {
                return Err(format!("sandboxed processor \"{path}\" is not supported by the in-memory engine").into())
            }
        };
        let shared = Arc::new(WorkerShared {
            queue: self.state(queue, &QueueOptions::default()),
            processor,
            concurrency: options.concurrency.max(1),
            listeners: Mutex::new(Vec::new()),
            closing: CancellationToken::new(),
            running: AtomicBool::new(true),
        });
        let task = tokio::spawn(run_worker(Arc::clone(&shared)));
        Ok(Arc::new(MemoryWorker {
            shared,
            task: Mutex::new(Some(task)),
        }))
    }
}
