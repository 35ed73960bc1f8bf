//! Contracts required from the external job-queue engine.
//!
//! The composition layer never stores, retries or schedules jobs itself. It
//! only needs to create queues and workers, pause and resume queues, upsert
//! job schedulers, enqueue jobs and subscribe to worker events. Any engine
//! implementing [`QueueEngine`] can be plugged into a
//! [`WorkerRegistry`](crate::WorkerRegistry).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BoxError;

/// Where the engine's backing store lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub db: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
        }
    }
}

/// Per-job options understood by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Explicit job id; engines generate one when absent
    pub job_id: Option<String>,
    /// Delay before the job becomes eligible, in milliseconds
    pub delay_ms: Option<u64>,
    /// Attempts before the job is considered failed; retry is the engine's business
    pub attempts: Option<u32>,
    /// Lower runs first
    pub priority: Option<u32>,
}

/// Queue creation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Key prefix in the backing store
    pub prefix: Option<String>,
    /// Defaults merged into every job added to the queue
    pub default_job_options: JobOptions,
}

/// Worker creation options. `extra` is passed to the engine untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Jobs processed in parallel by one worker
    pub concurrency: usize,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            extra: HashMap::new(),
        }
    }
}

/// When a job scheduler fires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatOptions {
    /// Fixed interval in milliseconds
    pub every_ms: Option<u64>,
    /// Cron pattern, for engines that support one
    pub pattern: Option<String>,
    /// Stop after this many jobs
    pub limit: Option<u32>,
    /// Fire once right away instead of after the first interval
    pub immediately: bool,
}

impl RepeatOptions {
    /// Fires every `ms` milliseconds.
    pub fn every(ms: u64) -> Self {
        Self {
            every_ms: Some(ms),
            ..Self::default()
        }
    }

    /// Fires on a cron pattern.
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Self::default()
        }
    }
}

/// Shape of the jobs a scheduler produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTemplate {
    pub name: Option<String>,
    pub data: Option<Value>,
    pub opts: Option<JobOptions>,
}

/// One `upsert_job_scheduler` call: an id plus when and what to enqueue.
///
/// Upserting an id that already exists replaces the previous rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobScheduler {
    pub id: String,
    pub repeat: RepeatOptions,
    pub template: JobTemplate,
}

/// A job as handed to processors and event listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub data: Value,
    pub options: JobOptions,
    /// Attempts started so far, including the current one
    pub attempts_made: u32,
    pub timestamp: DateTime<Utc>,
}

impl Job {
    /// Deserializes the payload.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Events a worker emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerEventKind {
    Active,
    Completed,
    Failed,
    Progress,
    Paused,
    Resumed,
    Drained,
    Stalled,
    Error,
    Closed,
}

impl WorkerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerEventKind::Active => "active",
            WorkerEventKind::Completed => "completed",
            WorkerEventKind::Failed => "failed",
            WorkerEventKind::Progress => "progress",
            WorkerEventKind::Paused => "paused",
            WorkerEventKind::Resumed => "resumed",
            WorkerEventKind::Drained => "drained",
            WorkerEventKind::Stalled => "stalled",
            WorkerEventKind::Error => "error",
            WorkerEventKind::Closed => "closed",
        }
    }
}

impl std::fmt::Display for WorkerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a worker event. Which fields are set depends on `kind`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub kind: WorkerEventKind,
    pub job: Option<Job>,
    /// Processor output, for `completed`
    pub result: Option<Value>,
    /// Rendered error, for `failed` and `error`
    pub error: Option<String>,
}

impl WorkerEvent {
    pub fn new(kind: WorkerEventKind) -> Self {
        Self {
            kind,
            job: None,
            result: None,
            error: None,
        }
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.job = Some(job);
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Engine-facing processor function: one job in, the job's result out.
pub type ProcessorFn = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// Engine-facing event listener.
pub type EventListener = Arc<dyn Fn(WorkerEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// What a worker runs for each job.
#[derive(Clone)]
pub enum Processor {
    /// In-process function
    Inline(ProcessorFn),
    /// Path of a script the engine runs in a sandbox
    Sandboxed(String),
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Processor::Inline(_) => f.write_str("Processor::Inline(..)"),
            Processor::Sandboxed(path) => f.debug_tuple("Processor::Sandboxed").field(path).finish(),
        }
    }
}

/// Creates queues and workers.
#[async_trait]
pub trait QueueEngine: Send + Sync + 'static {
    /// Creates (or attaches to) the queue `name`.
    async fn create_queue(
        &self,
        name: &str,
        options: &QueueOptions,
        connection: &ConnectionOptions,
    ) -> Result<Arc<dyn QueueHandle>, BoxError>;

    /// Starts a worker consuming `queue`.
    async fn create_worker(
        &self,
        queue: &str,
        processor: Processor,
        options: &WorkerOptions,
        connection: &ConnectionOptions,
    ) -> Result<Arc<dyn WorkerHandle>, BoxError>;
}

/// A live queue.
#[async_trait]
pub trait QueueHandle: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Stops workers from picking up jobs; jobs can still be added.
    async fn pause(&self) -> Result<(), BoxError>;

    async fn resume(&self) -> Result<(), BoxError>;

    fn is_paused(&self) -> bool;

    /// Creates or replaces the scheduler with `scheduler.id`.
    async fn upsert_job_scheduler(&self, scheduler: JobScheduler) -> Result<(), BoxError>;

    /// Enqueues one job.
    async fn add(&self, name: &str, data: Value, options: JobOptions) -> Result<Job, BoxError>;

    /// Releases the queue's resources.
    async fn close(&self) -> Result<(), BoxError>;

    /// Access to the concrete engine type.
    fn as_any(&self) -> &dyn Any;
}

impl std::fmt::Debug for dyn QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle").field("name", &self.name()).finish_non_exhaustive()
    }
}

impl dyn QueueHandle {
    /// Serializes `data` and enqueues it.
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        name: &str,
        data: &T,
        options: JobOptions,
    ) -> Result<Job, BoxError> {
        let data = serde_json::to_value(data)?;
        self.add(name, data, options).await
    }
}

/// A live worker.
#[async_trait]
pub trait WorkerHandle: Send + Sync + 'static {
    /// Name of the queue this worker consumes.
    fn queue_name(&self) -> &str;

    /// Subscribes to every occurrence of `event`.
    fn on(&self, event: WorkerEventKind, listener: EventListener);

    /// Subscribes to the next occurrence of `event` only.
    fn once(&self, event: WorkerEventKind, listener: EventListener);

    fn is_running(&self) -> bool;

    /// Stops taking jobs and waits for the ones in progress.
    async fn close(&self) -> Result<(), BoxError>;

    /// Access to the concrete engine type.
    fn as_any(&self) -> &dyn Any;
}

impl std::fmt::Debug for dyn WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").field("queue_name", &self.queue_name()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_data_deserializes_into_typed_payload() {
        #[derive(Deserialize)]
        struct Email {
            to: String,
        }

        let job = Job {
            id: "1".into(),
            name: "send".into(),
            queue: "mail".into(),
            data: json!({ "to": "a@example.com" }),
            options: JobOptions::default(),
            attempts_made: 1,
            timestamp: Utc::now(),
        };
        assert_eq!(job.data_as::<Email>().unwrap().to, "a@example.com");
        assert!(job.data_as::<u32>().is_err());
    }

    #[test]
    fn event_kinds_use_lowercase_names() {
        assert_eq!(WorkerEventKind::Completed.to_string(), "completed");
        assert_eq!(serde_json::to_value(WorkerEventKind::Drained).unwrap(), json!("drained"));
    }

    #[test]
    fn worker_options_keep_engine_specific_keys() {
        let options: WorkerOptions =
            serde_json::from_value(json!({ "concurrency": 4, "lockDuration": 30000 })).unwrap();
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.extra["lockDuration"], json!(30000));
    }
}
