//! In-process partitioned log broker with consumer-group assignment.
//!
//! Records, committed positions and group membership live in a
//! [`LogStore`]; this module adds partition assignment and fetch positions
//! on top of it. Partitions of a topic are spread round-robin over the
//! members of a group, ordered by consumer id. Every join, leave or expiry
//! bumps the group's generation, and each consumer reconciles its fetch
//! positions against the latest generation before it reads again.
//!
//! Membership is kept alive by heartbeats sent on every poll and commit.
//! Brokers in different processes can therefore share one store: a member
//! that stops heartbeating for longer than the session timeout loses its
//! partitions to the others.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, Consumer, ConsumerId, Offset, Partition, Producer, Record};

const FETCH_BATCH: usize = 64;
const DEFAULT_PARTITIONS: Partition = 4;
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Members of a consumer group at one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub generation: u64,
    /// Sorted by id.
    pub members: Vec<ConsumerId>,
}

/// Storage backend for topic partitions, committed group positions and
/// group membership.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Create a topic. Existing topics keep their partition count.
    async fn create_topic(&self, topic: &str, partitions: Partition) -> Result<(), BrokerError>;

    /// Partition count of a topic, or `None` if it does not exist.
    async fn partitions(&self, topic: &str) -> Result<Option<Partition>, BrokerError>;

    /// Append a record and return its offset.
    async fn append(
        &self,
        topic: &str,
        partition: Partition,
        key: &str,
        value: &[u8],
    ) -> Result<Offset, BrokerError>;

    /// Read up to `limit` records starting at offset `from`.
    async fn read(
        &self,
        topic: &str,
        partition: Partition,
        from: Offset,
        limit: usize,
    ) -> Result<Vec<Record>, BrokerError>;

    /// Next offset the group should read from, if it ever committed.
    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: Partition,
    ) -> Result<Option<Offset>, BrokerError>;

    /// Store the group's next offset. Positions never move backwards.
    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: Partition,
        next_offset: Offset,
    ) -> Result<(), BrokerError>;

    /// Add a new member to the group. Ids are unique within the store.
    async fn join(&self, group: &str, topic: &str) -> Result<ConsumerId, BrokerError>;

    /// Refresh `member` and return the group's current membership.
    ///
    /// Members not refreshed within `session_timeout` are removed. A member
    /// that was removed that way is added back by its own heartbeat.
    async fn heartbeat(
        &self,
        group: &str,
        topic: &str,
        member: ConsumerId,
        session_timeout: Duration,
    ) -> Result<Membership, BrokerError>;

    /// Remove `member` from the group.
    async fn leave(
        &self,
        group: &str,
        topic: &str,
        member: ConsumerId,
    ) -> Result<(), BrokerError>;
}

struct Shared<S> {
    store: Arc<S>,
    default_partitions: AtomicI32,
    session_timeout_ms: AtomicU64,
    appended: Notify,
}

impl<S: LogStore> Shared<S> {
    fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms.load(Ordering::SeqCst))
    }

    async fn leave(&self, group: &str, topic: &str, id: ConsumerId) {
        if let Err(e) = self.store.leave(group, topic, id).await {
            warn!(group, topic, consumer = %id, error = %e, "Failed to leave group");
        }
        self.appended.notify_waiters();
    }
}

/// Partitioned log broker running inside the process.
pub struct LogBroker<S: LogStore> {
    shared: Arc<Shared<S>>,
}

impl<S: LogStore> Clone for LogBroker<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: LogStore> LogBroker<S> {
    /// Create a broker owning `store`.
    pub fn new(store: S) -> Self {
        Self::with_store(Arc::new(store))
    }

    /// Create a broker over a store that may be shared with other brokers.
    ///
    /// Two brokers over the same store behave like two processes connected
    /// to the same cluster.
    pub fn with_store(store: Arc<S>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                default_partitions: AtomicI32::new(DEFAULT_PARTITIONS),
                session_timeout_ms: AtomicU64::new(DEFAULT_SESSION_TIMEOUT.as_millis() as u64),
                appended: Notify::new(),
            }),
        }
    }

    /// Partition count used when a topic is created implicitly.
    pub fn default_partitions(self, partitions: Partition) -> Self {
        self.shared
            .default_partitions
            .store(partitions.max(1), Ordering::SeqCst);
        self
    }

    /// How long a member may go without polling or committing before the
    /// rest of its group takes over its partitions.
    pub fn session_timeout(self, timeout: Duration) -> Self {
        self.shared
            .session_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// Create a topic with an explicit partition count.
    pub async fn create_topic(&self, topic: &str, partitions: Partition) -> Result<(), BrokerError> {
        self.shared.store.create_topic(topic, partitions.max(1)).await
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    async fn ensure_topic(shared: &Shared<S>, topic: &str) -> Result<Partition, BrokerError> {
        if let Some(partitions) = shared.store.partitions(topic).await? {
            return Ok(partitions);
        }
        let partitions = shared.default_partitions.load(Ordering::SeqCst);
        shared.store.create_topic(topic, partitions).await?;
        shared
            .store
            .partitions(topic)
            .await?
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }
}

/// Stable partition for a record key.
pub fn partition_for(key: &str, partitions: Partition) -> Partition {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as Partition
}

#[async_trait]
impl<S: LogStore> Broker for LogBroker<S> {
    async fn subscribe(&self, group: &str, topic: &str) -> Result<Arc<dyn Consumer>, BrokerError> {
        let partitions = Self::ensure_topic(&self.shared, topic).await?;
        let id = self.shared.store.join(group, topic).await?;
        self.shared.appended.notify_waiters();

        info!(group, topic, consumer = %id, partitions, "Consumer joined group");

        Ok(Arc::new(LogConsumer {
            id,
            group: group.to_string(),
            topic: topic.to_string(),
            partitions,
            shared: self.shared.clone(),
            fetch: tokio::sync::Mutex::new(FetchState::default()),
            closed: AtomicBool::new(false),
        }))
    }

    fn producer(&self) -> Arc<dyn Producer> {
        Arc::new(LogProducer {
            shared: self.shared.clone(),
        })
    }
}

struct LogProducer<S> {
    shared: Arc<Shared<S>>,
}

#[async_trait]
impl<S: LogStore> Producer for LogProducer<S> {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(Partition, Offset), BrokerError> {
        let partitions = LogBroker::ensure_topic(&self.shared, topic).await?;
        let partition = partition_for(key, partitions);
        let offset = self
            .shared
            .store
            .append(topic, partition, key, &value)
            .await?;
        self.shared.appended.notify_waiters();
        Ok((partition, offset))
    }
}

#[derive(Default)]
struct FetchState {
    generation: Option<u64>,
    positions: BTreeMap<Partition, Offset>,
    buffer: VecDeque<Record>,
    next: usize,
}

/// A member of a consumer group reading one topic.
pub struct LogConsumer<S: LogStore> {
    id: ConsumerId,
    group: String,
    topic: String,
    partitions: Partition,
    shared: Arc<Shared<S>>,
    fetch: tokio::sync::Mutex<FetchState>,
    closed: AtomicBool,
}

impl<S: LogStore> LogConsumer<S> {
    /// Heartbeat, then return the current generation and the partitions it
    /// assigns to this consumer.
    async fn assignment(&self) -> Result<(u64, Vec<Partition>), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let membership = self
            .shared
            .store
            .heartbeat(&self.group, &self.topic, self.id, self.shared.session_timeout())
            .await?;
        let index = membership
            .members
            .iter()
            .position(|m| *m == self.id)
            .ok_or(BrokerError::Closed)?;
        let members = membership.members.len();
        let assigned = (0..self.partitions)
            .filter(|p| *p as usize % members == index)
            .collect();
        Ok((membership.generation, assigned))
    }

    async fn sync_assignment(&self, fetch: &mut FetchState) -> Result<(), BrokerError> {
        let (generation, assigned) = self.assignment().await?;
        if fetch.generation == Some(generation) {
            return Ok(());
        }

        fetch.positions.retain(|p, _| assigned.contains(p));
        fetch.buffer.retain(|r| assigned.contains(&r.partition));
        for partition in &assigned {
            if fetch.positions.contains_key(partition) {
                continue;
            }
            let position = self
                .shared
                .store
                .committed(&self.group, &self.topic, *partition)
                .await?
                .unwrap_or(0);
            fetch.positions.insert(*partition, position);
        }
        fetch.generation = Some(generation);

        debug!(
            topic = %self.topic,
            consumer = %self.id,
            generation,
            partitions = ?assigned,
            "Partition assignment updated"
        );
        Ok(())
    }

    async fn fill(&self, fetch: &mut FetchState) -> Result<bool, BrokerError> {
        let partitions: Vec<Partition> = fetch.positions.keys().copied().collect();
        for i in 0..partitions.len() {
            let slot = (fetch.next + i) % partitions.len();
            let partition = partitions[slot];
            let from = fetch.positions.get(&partition).copied().unwrap_or(0);
            let records = self
                .shared
                .store
                .read(&self.topic, partition, from, FETCH_BATCH)
                .await?;
            if let Some(last) = records.last() {
                fetch.positions.insert(partition, last.offset + 1);
                fetch.buffer.extend(records);
                fetch.next = (slot + 1) % partitions.len();
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl<S: LogStore> Consumer for LogConsumer<S> {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<Record>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut fetch = self.fetch.lock().await;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }

            let notified = self.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.sync_assignment(&mut fetch).await?;
            if let Some(record) = fetch.buffer.pop_front() {
                return Ok(Some(record));
            }
            if self.fill(&mut fetch).await? {
                continue;
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn commit(&self, offsets: &[(Partition, Offset)]) -> Result<(), BrokerError> {
        let (_, assigned) = self.assignment().await?;
        let mut rejected = None;

        for &(partition, offset) in offsets {
            if !assigned.contains(&partition) {
                rejected.get_or_insert(partition);
                continue;
            }
            self.shared
                .store
                .commit(&self.group, &self.topic, partition, offset + 1)
                .await?;
        }

        match rejected {
            Some(partition) => Err(BrokerError::NotAssigned {
                topic: self.topic.clone(),
                partition,
            }),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.leave(&self.group, &self.topic, self.id).await;
            info!(group = %self.group, topic = %self.topic, consumer = %self.id, "Consumer left group");
        }
    }
}

impl<S: LogStore> Drop for LogConsumer<S> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Outside a runtime the member is left to expire.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = self.shared.clone();
        let (group, topic, id) = (self.group.clone(), self.topic.clone(), self.id);
        runtime.spawn(async move { shared.leave(&group, &topic, id).await });
    }
}
