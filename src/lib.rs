//! # tasklog
//!
//! A task queue on top of a partitioned log.
//!
//! Tasks are JSON envelopes published to a primary topic. Workers in a
//! consumer group read them, run the matching handler with bounded
//! concurrency, and commit offsets only up to the oldest task whose outcome
//! is still unknown. Failed tasks are re-published to a delayed topic that is
//! drained periodically.
//!
//! ## Why tasklog?
//!
//! - **Ordered commits** - Tasks finish in any order, offsets never skip an unfinished one
//! - **At-least-once** - A crash redelivers everything past the committed offset
//! - **Bounded** - Intake capacity and parallelism are fixed, retries are paced and capped
//! - **Embeddable** - Brokers and stores are traits; an in-process log broker is included
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tasklog::{handler_fn, LogBroker, MemoryLogStore, TaskQueueBuilder};
//! use tokio_util::sync::CancellationToken;
//!
//! let queue = TaskQueueBuilder::new(LogBroker::new(MemoryLogStore::new()))
//!     .handler(handler_fn("send_email", |email: Email, _cancel| async move {
//!         mailer.send(email).await.map_err(HandlerError::failed)
//!     }))
//!     .max_parallel_tasks(16)
//!     .build();
//!
//! queue.producer().enqueue("send_email", &user_id, &email).await?;
//! queue.run(CancellationToken::new()).await?;
//! ```
//!
//! ## Inspector
//!
//! Use `tasklog-inspector` to expose the ledger over HTTP:
//!
//! ```rust,ignore
//! use tasklog_inspector::TaskQueueInspectorExt;
//!
//! let queue = TaskQueueBuilder::new(broker)
//!     .handler(my_handler)
//!     .with_inspector(3000)
//!     .build();
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite log store and recorder

pub mod broker;
pub mod config;
pub mod envelope;
pub mod executor;
pub mod handler;
pub mod intake;
pub mod ledger;
pub mod producer;
pub mod queue;
pub mod recorder;
pub mod retry;

pub use broker::{
    Broker, BrokerError, Consumer, ConsumerId, LogBroker, LogStore, MemoryLogStore, Membership,
    Offset, Partition, Producer, Record,
};
pub use config::{ConfigError, QueueConfig};
pub use envelope::{EnvelopeError, TaskEnvelope};
pub use executor::{Decision, Executor};
pub use handler::{handler_fn, DispatchError, Handler, HandlerError, HandlerRegistry};
pub use ledger::{EntryState, Ledger, LedgerHandle, QueueSnapshot};
pub use producer::{EnqueueError, TaskProducer};
pub use queue::{QueueError, TaskQueue, TaskQueueBuilder};
pub use recorder::{NoopRecorder, Recorder, Resolution};
pub use retry::RetryPolicy;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use broker::SqliteLogStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRecorder;
