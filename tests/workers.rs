#![cfg(feature = "memory-engine")]

use ferrous_modular::worker::memory::{MemoryEngine, MemoryQueue};
use ferrous_modular::worker::{
    self, ConnectionOptions, Job, JobOptions, JobTemplate, RepeatOptions, WorkerEvent, WorkerEventKind,
    WorkerOptions,
};
use ferrous_modular::{
    define_singleton, BoxError, ModularError, RegisterMode, RegistryKind, ServiceDeps, ServiceRegistry,
    WorkerRegistry,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn registries() -> (ServiceRegistry, WorkerRegistry) {
    let services = ServiceRegistry::new();
    let workers = WorkerRegistry::new(services.clone(), Arc::new(MemoryEngine::new()));
    (services, workers)
}

fn echo(name: &str) -> worker::WorkerDescriptor {
    worker::queue(name)
        .connection(ConnectionOptions::default())
        .processor(|job: Job, _deps: ServiceDeps| async move { Ok::<_, BoxError>(job.data) })
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a worker event")
        .expect("event channel closed")
}

// ===== Registration =====

#[tokio::test]
async fn test_queues_start_paused_until_resumed() {
    let (_, workers) = registries();
    workers.register(echo("mail")).await.unwrap();

    let queue = workers.get_queue("mail").unwrap();
    assert!(queue.is_paused());
    assert!(workers.get_worker("mail").unwrap().is_running());

    workers.resume_queues().await.unwrap();
    assert!(!queue.is_paused());
}

#[tokio::test]
async fn test_duplicate_queue_keeps_the_first() {
    let (_, workers) = registries();
    workers.register(echo("mail")).await.unwrap();

    let err = workers.register(echo("mail")).await.unwrap_err();
    assert!(matches!(
        err,
        ModularError::DuplicateRegistration { kind: RegistryKind::Queue, ref name } if name == "mail"
    ));
    assert_eq!(workers.get_queue("mail").unwrap().name(), "mail");
    assert_eq!(workers.queues().names(), vec!["mail".to_string()]);
}

#[tokio::test]
async fn test_unknown_names_are_not_found() {
    let (_, workers) = registries();
    assert!(workers.get_queue("nope").unwrap_err().is_not_found());
    assert!(workers.get_worker("nope").unwrap_err().is_not_found());
    assert!(workers.queues().get("nope").is_err());
    assert!(workers.workers().get("nope").is_err());
}

#[tokio::test]
async fn test_queue_only_mode_creates_no_worker() {
    let (_, workers) = registries();
    workers
        .register_with(echo("reports"), RegisterMode::QueueOnly)
        .await
        .unwrap();

    assert!(workers.get_queue("reports").is_ok());
    assert!(workers.get_worker("reports").unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_sandboxed_processor_is_refused_by_memory_engine() {
    let (_, workers) = registries();
    let descriptor = worker::queue("scripts")
        .connection(ConnectionOptions::default())
        .sandboxed("./processor.js");
    assert!(descriptor.is_sandboxed());

    let err = workers.register(descriptor).await.unwrap_err();
    assert!(matches!(err, ModularError::Queue { .. }));
}

// ===== Processing =====

#[tokio::test]
async fn test_processor_resolves_services_and_enqueues() {
    let (services, workers) = registries();
    services
        .register(define_singleton("prefix", |_| async { Ok(String::from("hello ")) }))
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let greet = worker::queue("greet")
        .on(WorkerEventKind::Completed, {
            let tx = tx.clone();
            move |_deps: ServiceDeps, event: WorkerEvent| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            }
        })
        .connection(ConnectionOptions::default())
        .processor(|job: Job, deps: ServiceDeps| async move {
            let prefix = deps.services.get::<String>("prefix").await?;
            let name: String = job.data_as()?;
            deps.queues
                .get("audit")?
                .add("greeted", json!(name.clone()), JobOptions::default())
                .await?;
            Ok::<_, BoxError>(format!("{prefix}{name}"))
        });
    workers.register(greet).await.unwrap();
    workers
        .register_with(echo("audit"), RegisterMode::QueueOnly)
        .await
        .unwrap();
    workers.resume_queues().await.unwrap();

    workers
        .get_queue("greet")
        .unwrap()
        .enqueue("say", "ada", JobOptions::default())
        .await
        .unwrap();

    let event = recv(&mut rx).await;
    assert_eq!(event.kind, WorkerEventKind::Completed);
    assert_eq!(event.result, Some(json!("hello ada")));

    let audit = workers.get_queue("audit").unwrap();
    let audit = audit.as_any().downcast_ref::<MemoryQueue>().unwrap();
    assert_eq!(audit.waiting_count(), 1);
}

#[tokio::test]
async fn test_processor_errors_reach_the_engine() {
    let (_, workers) = registries();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let failing = worker::queue("fragile")
        .on(WorkerEventKind::Failed, move |_deps: ServiceDeps, event: WorkerEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        })
        .connection(ConnectionOptions::default())
        .processor(|_job: Job, _deps: ServiceDeps| async { Err::<Value, BoxError>("broken".into()) });
    workers.register(failing).await.unwrap();
    workers.resume_queues().await.unwrap();

    let queue = workers.get_queue("fragile").unwrap();
    queue.add("try", Value::Null, JobOptions::default()).await.unwrap();

    let event = recv(&mut rx).await;
    assert_eq!(event.error.as_deref(), Some("broken"));
    let memory = queue.as_any().downcast_ref::<MemoryQueue>().unwrap();
    assert_eq!(memory.failed().len(), 1);
}

#[tokio::test]
async fn test_listener_errors_are_swallowed() {
    let (_, workers) = registries();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let descriptor = worker::queue("noisy")
        .on(WorkerEventKind::Completed, |_deps: ServiceDeps, _event: WorkerEvent| async {
            Err::<(), BoxError>("listener exploded".into())
        })
        .on(WorkerEventKind::Completed, move |_deps: ServiceDeps, event: WorkerEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        })
        .connection(ConnectionOptions::default())
        .processor(|job: Job, _deps: ServiceDeps| async move { Ok::<_, BoxError>(job.name) });
    workers.register(descriptor).await.unwrap();
    workers.resume_queues().await.unwrap();

    let queue = workers.get_queue("noisy").unwrap();
    queue.add("first", Value::Null, JobOptions::default()).await.unwrap();
    queue.add("second", Value::Null, JobOptions::default()).await.unwrap();

    assert_eq!(recv(&mut rx).await.result, Some(json!("first")));
    assert_eq!(recv(&mut rx).await.result, Some(json!("second")));
    assert!(workers.get_worker("noisy").unwrap().is_running());
}

#[tokio::test(start_paused = true)]
async fn test_schedulers_are_upserted_before_resume() {
    let (_, workers) = registries();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let descriptor = worker::queue("ticks")
        .options(WorkerOptions {
            concurrency: 2,
            ..WorkerOptions::default()
        })
        .upsert_job_scheduler(
            "every-second",
            RepeatOptions {
                limit: Some(2),
                ..RepeatOptions::every(1000)
            },
            JobTemplate {
                name: Some("tick".into()),
                data: Some(json!({ "n": 1 })),
                opts: None,
            },
        )
        .on(WorkerEventKind::Completed, move |_deps: ServiceDeps, event: WorkerEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        })
        .connection(ConnectionOptions::default())
        .processor(|job: Job, _deps: ServiceDeps| async move { Ok::<_, BoxError>(job.name) });
    workers.register(descriptor).await.unwrap();

    let queue = workers.get_queue("ticks").unwrap();
    let memory = queue.as_any().downcast_ref::<MemoryQueue>().unwrap();
    assert_eq!(memory.scheduler_ids(), vec!["every-second".to_string()]);

    workers.resume_queues().await.unwrap();
    assert_eq!(recv(&mut rx).await.result, Some(json!("tick")));
    assert_eq!(recv(&mut rx).await.result, Some(json!("tick")));
}

#[tokio::test]
async fn test_close_all_stops_workers() {
    let (_, workers) = registries();
    workers.register(echo("a")).await.unwrap();
    workers.register(echo("b")).await.unwrap();
    workers.resume_queues().await.unwrap();

    workers.close_all().await.unwrap();
    assert!(!workers.get_worker("a").unwrap().is_running());
    assert!(!workers.get_worker("b").unwrap().is_running());
}
