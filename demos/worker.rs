//! A worker process backed by the SQLite log store.
//!
//! This example demonstrates:
//! - Implementing the Handler trait and registering a closure with `handler_fn`
//! - Loading `QueueConfig` from `TASKLOG_*` environment variables
//! - Recording outcomes with `SqliteRecorder`
//! - Graceful shutdown on Ctrl-C
//!
//! Run with `RUST_LOG=tasklog=debug cargo run --example worker`. Set
//! `TASKLOG_BOOTSTRAP_SERVERS=sqlite://tasks.db?mode=rwc` to keep the log
//! between runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tasklog::{
    handler_fn, Handler, HandlerError, LogBroker, QueueConfig, SqliteLogStore, SqliteRecorder,
    TaskEnvelope, TaskQueueBuilder,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Resize {
    image: String,
    width: u32,
}

/// Resizes images; fails for anything that is not a PNG.
struct ResizeHandler;

#[async_trait]
impl Handler for ResizeHandler {
    type Payload = Resize;

    fn name(&self) -> &'static str {
        "resize"
    }

    fn can_handle(&self, envelope: &TaskEnvelope) -> bool {
        envelope.task_type.starts_with("resize")
    }

    async fn execute(&self, task: Resize, cancel: CancellationToken) -> Result<(), HandlerError> {
        if !task.image.ends_with(".png") {
            return Err(HandlerError::failed(anyhow::anyhow!(
                "unsupported image format: {}",
                task.image
            )));
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(HandlerError::Canceled),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                tracing::info!(image = %task.image, width = task.width, "Image resized");
                Ok(())
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Notify {
    user: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tasklog=info")),
        )
        .init();

    // Short retry pacing for the demo; the environment still wins.
    let demo_defaults = [("TASKLOG_DELAYED_BASE_MS", "2000"), ("TASKLOG_MAX_TASK_RETRIES", "3")]
        .map(|(var, value)| (var.to_string(), value.to_string()));
    let config = QueueConfig::from_vars(demo_defaults.into_iter().chain(std::env::vars()))?;

    let store = SqliteLogStore::connect(&config.bootstrap_servers).await?;
    let recorder = SqliteRecorder::new(store.pool().clone());
    recorder.run_migrations().await?;

    let queue = TaskQueueBuilder::new(LogBroker::new(store))
        .config(config)
        .handler(ResizeHandler)
        .handler(handler_fn("notify", |task: Notify, _| async move {
            tracing::info!(user = %task.user, "Notification sent");
            Ok(())
        }))
        .recorder(recorder)
        .build();

    let producer = queue.producer();
    for (i, image) in ["cat.png", "dog.jpg", "bird.png"].iter().enumerate() {
        let task = Resize {
            image: image.to_string(),
            width: 320 * (i as u32 + 1),
        };
        producer.enqueue("resize", image, &task).await?;
    }
    producer
        .enqueue("notify", "alice", &Notify { user: "alice".to_string() })
        .await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    println!("Worker running, press Ctrl-C to stop");
    queue.run(cancel).await?;
    Ok(())
}
