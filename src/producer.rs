//! Publishing tasks to the primary topic.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::broker::{BrokerError, Offset, Partition, Producer};
use crate::envelope::{EnvelopeError, TaskEnvelope};

/// Error returned by [`TaskProducer::enqueue`].
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("publish failed: {0}")]
    Publish(#[from] BrokerError),
}

/// Publishes typed payloads as task envelopes.
///
/// There is no local buffering: a publish failure is returned to the caller.
#[derive(Clone)]
pub struct TaskProducer {
    producer: Arc<dyn Producer>,
    topic: String,
}

impl TaskProducer {
    pub fn new(producer: Arc<dyn Producer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish `payload` as a `task_type` task, keyed by `key`.
    pub async fn enqueue<T: Serialize>(
        &self,
        task_type: &str,
        key: &str,
        payload: &T,
    ) -> Result<(Partition, Offset), EnqueueError> {
        let envelope = TaskEnvelope::new(task_type, payload)?;
        let (partition, offset) = self
            .producer
            .send(&self.topic, key, envelope.encode()?)
            .await?;

        debug!(topic = %self.topic, task_type, key, partition, offset, "Task enqueued");
        Ok((partition, offset))
    }
}
