//! Tests for several queues sharing one consumer group.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tasklog::{
    handler_fn, HandlerError, LogBroker, LogStore, MemoryLogStore, Offset, TaskQueue,
    TaskQueueBuilder,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Job {
    id: u32,
}

macro_rules! wait_for {
    ($timeout:expr, $cond:expr) => {
        tokio::time::timeout($timeout, async {
            while !$cond {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    };
}

fn recording_queue(
    broker: LogBroker<MemoryLogStore>,
    seen: Arc<Mutex<Vec<u32>>>,
) -> TaskQueue {
    TaskQueueBuilder::new(broker)
        .group_id("workers")
        .poll_timeout(Duration::from_millis(20))
        .delayed_base(Duration::from_millis(10))
        .handler(handler_fn("job", move |job: Job, _| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(job.id);
                Ok(())
            }
        }))
        .build()
}

async fn committed_total(store: &MemoryLogStore) -> Offset {
    let partitions = store.partitions("tasks").await.unwrap().unwrap_or(0);
    let mut total = 0;
    for partition in 0..partitions {
        total += store
            .committed("workers", "tasks", partition)
            .await
            .unwrap()
            .unwrap_or(0);
    }
    total
}

fn start(queue: TaskQueue, cancel: &CancellationToken) -> JoinHandle<TaskQueue> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        queue.run(cancel).await.unwrap();
        queue
    })
}

#[tokio::test]
async fn test_group_members_process_disjoint_tasks() {
    let broker = LogBroker::new(MemoryLogStore::new());
    let first_seen = Arc::new(Mutex::new(Vec::new()));
    let second_seen = Arc::new(Mutex::new(Vec::new()));

    let first = recording_queue(broker.clone(), first_seen.clone());
    let second = recording_queue(broker.clone(), second_seen.clone());
    let producer = first.producer();

    let cancel = CancellationToken::new();
    let first = start(first, &cancel);
    let second = start(second, &cancel);

    // Let both members join before anything is published.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for id in 0..100 {
        producer
            .enqueue("job", &format!("task-{id}"), &Job { id })
            .await
            .unwrap();
    }

    wait_for!(
        Duration::from_secs(10),
        first_seen.lock().await.len() + second_seen.lock().await.len() >= 100
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    cancel.cancel();
    first.await.unwrap();
    second.await.unwrap();

    let first: HashSet<u32> = first_seen.lock().await.iter().copied().collect();
    let second: HashSet<u32> = second_seen.lock().await.iter().copied().collect();

    assert!(!first.is_empty());
    assert!(!second.is_empty());
    assert!(first.is_disjoint(&second));
    assert_eq!(first.len() + second.len(), 100);
    assert_eq!(first_seen.lock().await.len() + second_seen.lock().await.len(), 100);
}

#[tokio::test]
async fn test_restarted_member_picks_up_unfinished_tasks() {
    let store = Arc::new(MemoryLogStore::new());
    let first_done = Arc::new(Mutex::new(Vec::new()));

    let done = first_done.clone();
    let first = TaskQueueBuilder::new(LogBroker::with_store(store.clone()))
        .group_id("workers")
        .poll_timeout(Duration::from_millis(20))
        .delayed_base(Duration::from_millis(10))
        .handler(handler_fn("job", move |job: Job, cancel: CancellationToken| {
            let done = done.clone();
            async move {
                if job.id >= 5 {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(HandlerError::Canceled),
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                    }
                }
                done.lock().await.push(job.id);
                Ok(())
            }
        }))
        .build();

    let producer = first.producer();
    for id in 0..20 {
        producer.enqueue("job", "one-key", &Job { id }).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let handle = start(first, &cancel);
    wait_for!(Duration::from_secs(5), first_done.lock().await.len() >= 5);

    cancel.cancel();
    let first = handle.await.unwrap();
    assert!(first.ledger().snapshot().await.is_empty());

    // A fresh process: new broker over the same log.
    let second_done = Arc::new(Mutex::new(Vec::new()));
    let second = recording_queue(LogBroker::with_store(store.clone()), second_done.clone());
    let cancel = CancellationToken::new();
    let handle = start(second, &cancel);

    wait_for!(Duration::from_secs(5), second_done.lock().await.len() >= 15);
    cancel.cancel();
    handle.await.unwrap();

    let first: HashSet<u32> = first_done.lock().await.iter().copied().collect();
    let second: HashSet<u32> = second_done.lock().await.iter().copied().collect();

    assert_eq!(first, (0..5).collect());
    assert!((5..20).all(|id| second.contains(&id)));
    assert_eq!(first.union(&second).count(), 20);
}

#[tokio::test]
async fn test_aborted_worker_redelivers_uncommitted_tasks() {
    let store = Arc::new(MemoryLogStore::new());
    let first_done = Arc::new(Mutex::new(Vec::new()));

    let done = first_done.clone();
    let first = TaskQueueBuilder::new(LogBroker::with_store(store.clone()))
        .group_id("workers")
        .poll_timeout(Duration::from_millis(20))
        .delayed_base(Duration::from_millis(10))
        .handler(handler_fn("job", move |job: Job, _| {
            let done = done.clone();
            async move {
                // Stuck until the worker dies; cancellation is never observed.
                if job.id >= 5 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                done.lock().await.push(job.id);
                Ok(())
            }
        }))
        .build();

    let producer = first.producer();
    for id in 0..20 {
        producer.enqueue("job", "one-key", &Job { id }).await.unwrap();
    }

    let handle = tokio::spawn(async move {
        let _ = first.run(CancellationToken::new()).await;
    });
    wait_for!(Duration::from_secs(5), committed_total(&store).await >= 5);

    // No cancellation and no final commit pass: the worker just goes away.
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    assert_eq!(committed_total(&store).await, 5);

    let second_done = Arc::new(Mutex::new(Vec::new()));
    let second = recording_queue(LogBroker::with_store(store.clone()), second_done.clone());
    let cancel = CancellationToken::new();
    let handle = start(second, &cancel);

    wait_for!(Duration::from_secs(5), second_done.lock().await.len() >= 15);
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    handle.await.unwrap();

    let mut second: Vec<u32> = second_done.lock().await.clone();
    second.sort();
    assert_eq!(first_done.lock().await.len(), 5);
    assert_eq!(second, (5..20).collect::<Vec<_>>());
    assert_eq!(committed_total(&store).await, 20);
}
