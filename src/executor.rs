//! Executes ledger entries and routes failures to the retry topic.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::{BrokerError, Producer, Record};
use crate::config::QueueConfig;
use crate::envelope::TaskEnvelope;
use crate::handler::{DispatchError, HandlerRegistry};
use crate::ledger::{EntryState, LedgerEntry};
use crate::recorder::Resolution;
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};

/// What to do with a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Succeed,
    /// Re-publish to the delayed topic with an incremented counter.
    Retry,
    /// Out of retries; dead-letter if configured, then release.
    Exhausted,
    /// Release without retrying.
    Skip,
    Cancel,
}

/// Decide the fate of a task from its dispatch outcome.
///
/// `attempts` is the retry counter of the envelope that was executed.
pub fn resolve(outcome: &Result<(), DispatchError>, attempts: u32, max_retries: u32) -> Decision {
    match outcome {
        Ok(()) => Decision::Succeed,
        Err(e) if e.is_canceled() => Decision::Cancel,
        Err(DispatchError::InvalidPayload { .. }) => Decision::Skip,
        Err(_) => retry_or_exhaust(attempts, max_retries),
    }
}

fn retry_or_exhaust(attempts: u32, max_retries: u32) -> Decision {
    if attempts >= max_retries {
        Decision::Exhausted
    } else {
        Decision::Retry
    }
}

/// Runs tasks against the handler registry.
pub struct Executor {
    registry: Arc<HandlerRegistry>,
    producer: Arc<dyn Producer>,
    delayed_topic: String,
    dead_letter_topic: Option<String>,
    max_task_retries: u32,
    republish: RetryPolicy,
    republish_budget: Duration,
}

impl Executor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        producer: Arc<dyn Producer>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            registry,
            producer,
            delayed_topic: config.delayed_topic.clone(),
            dead_letter_topic: config.dead_letter_topic.clone(),
            max_task_retries: config.max_task_retries,
            republish: RetryPolicy::exponential(config.republish_attempts),
            republish_budget: config.republish_budget,
        }
    }

    /// Override the backoff used when re-publishing.
    pub fn with_republish_policy(mut self, policy: RetryPolicy) -> Self {
        self.republish = policy;
        self
    }

    /// Execute `entry` and move it to its terminal state.
    ///
    /// The entry is marked `Executing` first. A handler panic counts as a
    /// handler failure, and so does a handler that reports cancellation
    /// while `cancel` has not fired.
    pub async fn execute(&self, entry: &LedgerEntry, cancel: &CancellationToken) -> Resolution {
        entry.transition(EntryState::Executing);
        let record = entry.record();

        let mut resolution = Resolution {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            task_type: None,
            execute_count: 0,
            state: EntryState::Skipped,
            error: None,
        };

        let (state, error) = match TaskEnvelope::decode(&record.value) {
            Ok(envelope) => {
                resolution.task_type = Some(envelope.task_type.clone());
                resolution.execute_count = envelope.attempts();
                self.run(&envelope, record, cancel).await
            }
            Err(e) => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Dropping malformed envelope"
                );
                (EntryState::Skipped, Some(e.to_string()))
            }
        };

        entry.transition(state);
        resolution.state = entry.state();
        resolution.error = error;
        resolution
    }

    async fn run(
        &self,
        envelope: &TaskEnvelope,
        record: &Record,
        cancel: &CancellationToken,
    ) -> (EntryState, Option<String>) {
        let dispatch = AssertUnwindSafe(self.registry.dispatch(envelope, cancel.clone()))
            .catch_unwind()
            .map(|result| {
                result.unwrap_or_else(|_| {
                    Err(DispatchError::Panicked {
                        task_type: envelope.task_type.clone(),
                    })
                })
            });

        // A handler that already finished keeps its outcome.
        let outcome = tokio::select! {
            biased;
            outcome = dispatch => outcome,
            _ = cancel.cancelled() => return (EntryState::Canceled, None),
        };

        let attempts = envelope.attempts();
        let error = outcome.as_ref().err().map(|e| e.to_string());

        let mut decision = resolve(&outcome, attempts, self.max_task_retries);
        if decision == Decision::Cancel && !cancel.is_cancelled() {
            decision = retry_or_exhaust(attempts, self.max_task_retries);
        }

        match decision {
            Decision::Succeed => {
                debug!(
                    task_type = %envelope.task_type,
                    partition = record.partition,
                    offset = record.offset,
                    "Task succeeded"
                );
                (EntryState::Success, None)
            }
            Decision::Cancel => (EntryState::Canceled, error),
            Decision::Skip => {
                error!(
                    task_type = %envelope.task_type,
                    partition = record.partition,
                    offset = record.offset,
                    error = error.as_deref().unwrap_or_default(),
                    "Dropping task with unusable payload"
                );
                (EntryState::Skipped, error)
            }
            Decision::Retry => {
                let retry = envelope.next_attempt();
                match self.publish(&self.delayed_topic, &retry, &record.key, cancel).await {
                    Ok(()) => {
                        warn!(
                            task_type = %envelope.task_type,
                            execute_count = attempts + 1,
                            error = error.as_deref().unwrap_or_default(),
                            "Task failed, scheduled for retry"
                        );
                        (EntryState::Failure, error)
                    }
                    Err(RetryError::Canceled) => (EntryState::Canceled, error),
                    Err(RetryError::Exhausted { attempts: tries, last }) => {
                        error!(
                            task_type = %envelope.task_type,
                            partition = record.partition,
                            offset = record.offset,
                            tries,
                            error = %last,
                            "Could not re-publish failed task, dropping it"
                        );
                        (EntryState::Skipped, error)
                    }
                }
            }
            Decision::Exhausted => self.dead_letter(envelope, record, error, cancel).await,
        }
    }

    async fn dead_letter(
        &self,
        envelope: &TaskEnvelope,
        record: &Record,
        error: Option<String>,
        cancel: &CancellationToken,
    ) -> (EntryState, Option<String>) {
        let Some(topic) = &self.dead_letter_topic else {
            error!(
                task_type = %envelope.task_type,
                execute_count = envelope.attempts(),
                error = error.as_deref().unwrap_or_default(),
                "Task exhausted its retries, dropping it"
            );
            return (EntryState::Skipped, error);
        };

        match self.publish(topic, envelope, &record.key, cancel).await {
            Ok(()) => {
                error!(
                    task_type = %envelope.task_type,
                    execute_count = envelope.attempts(),
                    dead_letter_topic = %topic,
                    error = error.as_deref().unwrap_or_default(),
                    "Task exhausted its retries, moved to dead-letter topic"
                );
                (EntryState::Skipped, error)
            }
            Err(RetryError::Canceled) => (EntryState::Canceled, error),
            Err(RetryError::Exhausted { last, .. }) => {
                error!(
                    task_type = %envelope.task_type,
                    dead_letter_topic = %topic,
                    error = %last,
                    "Could not dead-letter task, dropping it"
                );
                (EntryState::Skipped, error)
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        envelope: &TaskEnvelope,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RetryError<BrokerError>> {
        let value = envelope.encode().map_err(|e| RetryError::Exhausted {
            attempts: 0,
            last: BrokerError::Transport(e.to_string()),
        })?;

        retry_with_backoff(&self.republish, self.republish_budget, cancel, |_| {
            let producer = self.producer.clone();
            let value = value.clone();
            async move { producer.send(topic, key, value).await.map(|_| ()) }
        })
        .await
    }
}
