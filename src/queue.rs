//! Task queue that consumes both topics and executes tasks concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Consumer, ConsumerId};
use crate::config::{ConfigError, QueueConfig};
use crate::executor::Executor;
use crate::handler::{Handler, HandlerRegistry};
use crate::intake::Intake;
use crate::ledger::{EntryState, LedgerHandle};
use crate::producer::TaskProducer;
use crate::recorder::{NoopRecorder, Recorder};
use crate::retry::RetryPolicy;

/// Error returned when the queue cannot start.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// A task queue bound to a broker and a set of handlers.
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    config: QueueConfig,
    registry: Arc<HandlerRegistry>,
    recorder: Arc<dyn Recorder>,
    ledger: LedgerHandle,
    republish_policy: Option<RetryPolicy>,
}

impl TaskQueue {
    /// Producer publishing to this queue's primary topic.
    pub fn producer(&self) -> TaskProducer {
        TaskProducer::new(self.broker.producer(), self.config.primary_topic.clone())
    }

    pub fn ledger(&self) -> LedgerHandle {
        self.ledger.clone()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Consume and execute tasks until `cancel` fires.
    ///
    /// On cancellation in-flight executions are awaited, a final commit pass
    /// runs and both consumers leave the group. Records still waiting in the
    /// intake channel are neither executed nor committed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), QueueError> {
        self.config.validate()?;
        let config = &self.config;

        let primary = self
            .broker
            .subscribe(&config.group_id, &config.primary_topic)
            .await?;
        let delayed = match self
            .broker
            .subscribe(&config.group_id, &config.delayed_topic)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                primary.close().await;
                return Err(e.into());
            }
        };

        info!(
            group = %config.group_id,
            primary_topic = %config.primary_topic,
            delayed_topic = %config.delayed_topic,
            max_parallel_tasks = config.max_parallel_tasks,
            "Task queue started"
        );

        let mut executor = Executor::new(self.registry.clone(), self.broker.producer(), config);
        if let Some(policy) = &self.republish_policy {
            executor = executor.with_republish_policy(policy.clone());
        }
        let shared = Arc::new(Shared {
            executor,
            ledger: self.ledger.clone(),
            recorder: self.recorder.clone(),
            consumers: [primary.clone(), delayed.clone()]
                .into_iter()
                .map(|c| (c.id(), c))
                .collect(),
        });

        let (intake, mut rx) =
            Intake::spawn(primary.clone(), delayed.clone(), config, cancel.clone());
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_tasks));
        let mut tasks = JoinSet::new();

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let consumer = delivery.consumer.id();
            let appended = self.ledger.lock().await.append(consumer, delivery.record);
            let entry = match appended {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(consumer = %consumer, error = %e, "Ignoring redelivered record");
                    continue;
                }
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    entry.transition(EntryState::Canceled);
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let shared = shared.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let resolution = shared.executor.execute(&entry, &cancel).await;
                drop(permit);

                if let Err(e) = shared.recorder.entry_resolved(&resolution).await {
                    warn!(
                        topic = %resolution.topic,
                        offset = resolution.offset,
                        error = %e,
                        "Failed to record task resolution"
                    );
                }
                shared.commit().await;
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Task execution aborted");
                }
            }
        }

        drop(rx);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Task execution aborted");
            }
        }
        intake.join().await;
        shared.commit().await;

        primary.close().await;
        delayed.close().await;

        let mut ledger = self.ledger.lock().await;
        let abandoned = ledger.forget(primary.id()) + ledger.forget(delayed.id());
        drop(ledger);

        info!(group = %config.group_id, abandoned, "Task queue stopped");
        Ok(())
    }
}

/// State shared by every execution of one run.
struct Shared {
    executor: Executor,
    ledger: LedgerHandle,
    recorder: Arc<dyn Recorder>,
    consumers: HashMap<ConsumerId, Arc<dyn Consumer>>,
}

impl Shared {
    /// Commit every safe prefix in the ledger.
    ///
    /// The ledger lock is held across the broker calls and the recorder, so
    /// commits stay monotonic per partition and are recorded in that order.
    async fn commit(&self) {
        let mut ledger = self.ledger.lock().await;
        let plan = ledger.collect_committable();

        if plan.is_empty() {
            for head in &plan.blocked {
                debug!(
                    consumer = %head.key.consumer,
                    partition = head.key.partition,
                    offset = head.offset,
                    state = %head.state,
                    "Nothing to commit"
                );
            }
            return;
        }

        for (id, offsets) in plan.offsets {
            let Some(consumer) = self.consumers.get(&id) else {
                debug!(consumer = %id, "Skipping commit for a consumer of a previous run");
                continue;
            };
            if let Err(e) = consumer.commit(&offsets).await {
                warn!(consumer = %id, topic = consumer.topic(), error = %e, "Offset commit failed");
                continue;
            }
            debug!(consumer = %id, topic = consumer.topic(), offsets = ?offsets, "Offsets committed");

            if let Err(e) = self
                .recorder
                .offsets_committed(id, consumer.topic(), &offsets)
                .await
            {
                warn!(consumer = %id, error = %e, "Failed to record commit");
            }
        }
    }
}

/// Builder for constructing a [`TaskQueue`].
pub struct TaskQueueBuilder {
    broker: Arc<dyn Broker>,
    config: QueueConfig,
    registry: HandlerRegistry,
    recorder: Arc<dyn Recorder>,
    ledger: LedgerHandle,
    republish_policy: Option<RetryPolicy>,
}

impl TaskQueueBuilder {
    /// Create a new builder with default configuration.
    pub fn new(broker: impl Broker + 'static) -> Self {
        Self {
            broker: Arc::new(broker),
            config: QueueConfig::default(),
            registry: HandlerRegistry::new(),
            recorder: Arc::new(NoopRecorder::new()),
            ledger: LedgerHandle::new(),
            republish_policy: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a handler. Handlers are tried in registration order.
    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.registry.register(handler);
        self
    }

    /// Set the recorder notified of resolutions and commits.
    pub fn recorder(mut self, recorder: impl Recorder + 'static) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    pub fn primary_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.primary_topic = topic.into();
        self
    }

    pub fn delayed_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.delayed_topic = topic.into();
        self
    }

    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.dead_letter_topic = Some(topic.into());
        self
    }

    /// Set the drain period of the delayed topic.
    pub fn delayed_base(mut self, period: Duration) -> Self {
        self.config.delayed_base = period;
        self
    }

    /// Set the maximum number of concurrently executing tasks.
    pub fn max_parallel_tasks(mut self, n: usize) -> Self {
        self.config.max_parallel_tasks = n;
        self
    }

    pub fn intake_capacity(mut self, n: usize) -> Self {
        self.config.intake_capacity = n;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn error_pause(mut self, pause: Duration) -> Self {
        self.config.error_pause = pause;
        self
    }

    pub fn max_task_retries(mut self, n: u32) -> Self {
        self.config.max_task_retries = n;
        self
    }

    /// Bound re-publishing of failed tasks by attempts and total time.
    pub fn republish(mut self, attempts: u32, budget: Duration) -> Self {
        self.config.republish_attempts = attempts;
        self.config.republish_budget = budget;
        self
    }

    /// Replace the backoff policy used to re-publish failed tasks.
    pub fn republish_policy(mut self, policy: RetryPolicy) -> Self {
        self.republish_policy = Some(policy);
        self
    }

    /// Ledger the built queue will use.
    pub fn ledger(&self) -> LedgerHandle {
        self.ledger.clone()
    }

    /// Build the queue.
    pub fn build(self) -> TaskQueue {
        TaskQueue {
            broker: self.broker,
            config: self.config,
            registry: Arc::new(self.registry),
            recorder: self.recorder,
            ledger: self.ledger,
            republish_policy: self.republish_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{LogBroker, MemoryLogStore};
    use crate::handler::handler_fn;

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let queue = TaskQueueBuilder::new(LogBroker::new(MemoryLogStore::new()))
            .max_parallel_tasks(0)
            .build();

        let err = queue.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Config(ConfigError::Zero {
                field: "max_parallel_tasks"
            })
        ));
    }

    #[tokio::test]
    async fn test_run_returns_after_cancel() {
        let queue = TaskQueueBuilder::new(LogBroker::new(MemoryLogStore::new()))
            .handler(handler_fn("noop", |_: serde_json::Value, _| async { Ok(()) }))
            .poll_timeout(Duration::from_millis(10))
            .delayed_base(Duration::from_millis(10))
            .build();

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });

        tokio::time::timeout(Duration::from_secs(2), queue.run(cancel))
            .await
            .expect("queue did not stop")
            .unwrap();
        assert!(queue.ledger().snapshot().await.is_empty());
    }

    #[test]
    fn test_builder_setters_update_config() {
        let queue = TaskQueueBuilder::new(LogBroker::new(MemoryLogStore::new()))
            .group_id("crawlers")
            .primary_topic("crawl")
            .delayed_topic("crawl-retry")
            .dead_letter_topic("crawl-dead")
            .max_task_retries(3)
            .republish(2, Duration::from_secs(5))
            .build();

        let config = queue.config();
        assert_eq!(config.group_id, "crawlers");
        assert_eq!(config.primary_topic, "crawl");
        assert_eq!(config.delayed_topic, "crawl-retry");
        assert_eq!(config.dead_letter_topic.as_deref(), Some("crawl-dead"));
        assert_eq!(config.max_task_retries, 3);
        assert_eq!(config.republish_attempts, 2);
        assert_eq!(queue.producer().topic(), "crawl");
    }
}
