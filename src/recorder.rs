//! Recording interface for task outcomes and committed offsets.

use async_trait::async_trait;

use crate::broker::{ConsumerId, Offset, Partition};
use crate::ledger::EntryState;

/// Final outcome of one consumed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub topic: String,
    pub partition: Partition,
    pub offset: Offset,
    /// `None` when the envelope could not be decoded.
    pub task_type: Option<String>,
    /// Retry counter carried by the envelope that was executed.
    pub execute_count: u32,
    pub state: EntryState,
    pub error: Option<String>,
}

/// Records queue activity for observability.
///
/// Errors are logged by the caller and never affect processing.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Record that an entry reached a terminal state.
    async fn entry_resolved(&self, resolution: &Resolution) -> anyhow::Result<()>;

    /// Record offsets committed for one consumer.
    async fn offsets_committed(
        &self,
        consumer: ConsumerId,
        topic: &str,
        offsets: &[(Partition, Offset)],
    ) -> anyhow::Result<()>;
}

/// A no-op recorder that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopRecorder;

impl NoopRecorder {
    /// Create a new no-op recorder.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Recorder for NoopRecorder {
    async fn entry_resolved(&self, _resolution: &Resolution) -> anyhow::Result<()> {
        Ok(())
    }

    async fn offsets_committed(
        &self,
        _consumer: ConsumerId,
        _topic: &str,
        _offsets: &[(Partition, Offset)],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
