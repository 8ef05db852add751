//! Broker client interface and the in-process log broker.

pub mod log;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use log::{LogBroker, LogStore, Membership};
pub use memory::MemoryLogStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLogStore;

pub type Partition = i32;
pub type Offset = i64;

/// Identifies one group member. Ids are allocated by the log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// A record read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: Partition,
    pub offset: Offset,
    pub key: String,
    pub value: Vec<u8>,
}

/// Error type for broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("partition {partition} of '{topic}' is not assigned to this consumer")]
    NotAssigned { topic: String, partition: Partition },

    #[error("consumer is closed")]
    Closed,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Publishes keyed records.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Append `value` to `topic`, returning where it landed.
    async fn send(
        &self,
        topic: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(Partition, Offset), BrokerError>;
}

/// A group member reading one topic.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn topic(&self) -> &str;

    /// Wait up to `timeout` for the next record. A zero timeout never waits.
    async fn poll(&self, timeout: Duration) -> Result<Option<Record>, BrokerError>;

    /// Mark every record up to and including each offset as processed.
    async fn commit(&self, offsets: &[(Partition, Offset)]) -> Result<(), BrokerError>;

    /// Leave the consumer group. Further polls fail with [`BrokerError::Closed`].
    async fn close(&self);
}

/// Entry point to a partitioned log broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Join `group` as a new member consuming `topic`.
    async fn subscribe(&self, group: &str, topic: &str) -> Result<Arc<dyn Consumer>, BrokerError>;

    fn producer(&self) -> Arc<dyn Producer>;
}
