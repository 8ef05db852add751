//! Per-partition completion ledger and the safe-prefix commit algorithm.
//!
//! Every consumed record gets a [`LedgerEntry`] appended to the queue of its
//! `(consumer, partition)`. Entries resolve in any order, but
//! [`Ledger::collect_committable`] only releases a queue's head while the
//! head is in a committable state. The committed offset of a partition can
//! therefore never pass a record whose outcome is still unknown.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::broker::{ConsumerId, Offset, Partition, Record};

/// Execution state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EntryState {
    Queued = 0,
    Executing = 1,
    /// Handler completed.
    Success = 2,
    /// Given up on; the record is released without being retried.
    Skipped = 3,
    /// Handler failed and the task was re-published for a later retry.
    Failure = 4,
    /// Torn down mid-flight. Terminal but never committed, so another
    /// consumer gets to read the record again.
    Canceled = 5,
}

impl EntryState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::Executing,
            2 => Self::Success,
            3 => Self::Skipped,
            4 => Self::Failure,
            _ => Self::Canceled,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Executing)
    }

    pub fn is_committable(self) -> bool {
        matches!(self, Self::Success | Self::Skipped | Self::Failure)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failure => "failure",
            Self::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// One consumed record and its execution state.
#[derive(Debug)]
pub struct LedgerEntry {
    consumer: ConsumerId,
    record: Record,
    state: AtomicU8,
}

impl LedgerEntry {
    fn new(consumer: ConsumerId, record: Record) -> Self {
        Self {
            consumer,
            record,
            state: AtomicU8::new(EntryState::Queued as u8),
        }
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` unless the entry already reached a terminal state.
    ///
    /// Returns whether the transition happened.
    pub fn transition(&self, next: EntryState) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if EntryState::from_u8(current).is_terminal() {
                    None
                } else {
                    Some(next as u8)
                }
            })
            .is_ok()
    }
}

/// Error type for ledger operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LedgerError {
    #[error("offset {offset} of partition {partition} arrived after offset {tail}")]
    OutOfOrder {
        partition: Partition,
        offset: Offset,
        tail: Offset,
    },
}

/// Key of one ledger queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub consumer: ConsumerId,
    pub partition: Partition,
}

/// Head of a queue that blocks committing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedHead {
    pub key: LedgerKey,
    pub offset: Offset,
    pub state: EntryState,
}

/// Offsets released by one pass of [`Ledger::collect_committable`].
#[derive(Debug, Default)]
pub struct CommitPlan {
    /// Highest committable offset per partition, grouped by consumer.
    pub offsets: BTreeMap<ConsumerId, Vec<(Partition, Offset)>>,
    /// Number of entries released.
    pub released: usize,
    /// Queues whose head stopped the pass.
    pub blocked: Vec<BlockedHead>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.released == 0
    }
}

/// Snapshot of one ledger queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub consumer: u64,
    pub partition: Partition,
    pub pending: usize,
    pub head_offset: Option<Offset>,
    pub head_state: Option<EntryState>,
}

/// In-memory table of consumed-but-not-committed entries.
#[derive(Debug, Default)]
pub struct Ledger {
    queues: BTreeMap<LedgerKey, VecDeque<Arc<LedgerEntry>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a record delivered by `consumer`, in state `Queued`.
    ///
    /// Offsets must strictly increase per queue.
    pub fn append(
        &mut self,
        consumer: ConsumerId,
        record: Record,
    ) -> Result<Arc<LedgerEntry>, LedgerError> {
        let key = LedgerKey {
            consumer,
            partition: record.partition,
        };
        let queue = self.queues.entry(key).or_default();

        if let Some(tail) = queue.back() {
            let tail = tail.record.offset;
            if record.offset <= tail {
                return Err(LedgerError::OutOfOrder {
                    partition: record.partition,
                    offset: record.offset,
                    tail,
                });
            }
        }

        let entry = Arc::new(LedgerEntry::new(consumer, record));
        queue.push_back(entry.clone());
        Ok(entry)
    }

    /// Release every committable prefix and report what to commit.
    pub fn collect_committable(&mut self) -> CommitPlan {
        let mut plan = CommitPlan::default();

        for (key, queue) in self.queues.iter_mut() {
            let mut last = None;
            while let Some(head) = queue.front() {
                let state = head.state();
                if !state.is_committable() {
                    plan.blocked.push(BlockedHead {
                        key: *key,
                        offset: head.record.offset,
                        state,
                    });
                    break;
                }
                last = Some(head.record.offset);
                queue.pop_front();
                plan.released += 1;
            }

            if let Some(offset) = last {
                plan.offsets
                    .entry(key.consumer)
                    .or_default()
                    .push((key.partition, offset));
            }
        }

        self.queues.retain(|_, queue| !queue.is_empty());
        plan
    }

    /// Drop every queue of `consumer`, returning how many entries were
    /// still pending. Used once the consumer has left its group.
    pub fn forget(&mut self, consumer: ConsumerId) -> usize {
        let mut dropped = 0;
        self.queues.retain(|key, queue| {
            if key.consumer == consumer {
                dropped += queue.len();
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Number of tracked entries across all queues.
    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        self.queues
            .iter()
            .map(|(key, queue)| QueueSnapshot {
                consumer: key.consumer.0,
                partition: key.partition,
                pending: queue.len(),
                head_offset: queue.front().map(|e| e.record.offset),
                head_state: queue.front().map(|e| e.state()),
            })
            .collect()
    }
}

/// Shared, lock-guarded ledger.
///
/// The same lock serializes appends and commit passes.
#[derive(Clone, Default)]
pub struct LedgerHandle {
    inner: Arc<Mutex<Ledger>>,
}

impl LedgerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.inner.lock().await
    }

    pub async fn snapshot(&self) -> Vec<QueueSnapshot> {
        self.inner.lock().await.snapshot()
    }
}
