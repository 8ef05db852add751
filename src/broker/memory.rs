//! In-memory implementation of LogStore.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::log::{LogStore, Membership};
use super::{BrokerError, ConsumerId, Offset, Partition, Record};

#[derive(Default)]
struct GroupState {
    generation: u64,
    /// Member id to last heartbeat.
    members: BTreeMap<ConsumerId, Instant>,
}

impl GroupState {
    fn membership(&self) -> Membership {
        Membership {
            generation: self.generation,
            members: self.members.keys().copied().collect(),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    topics: HashMap<String, Vec<Vec<(String, Vec<u8>)>>>,
    offsets: HashMap<(String, String, Partition), Offset>,
    groups: HashMap<(String, String), GroupState>,
    last_member: u64,
}

/// Log store that keeps everything in process memory.
///
/// Wrap it in an `Arc` and hand it to several brokers to simulate a
/// restart against the same cluster.
#[derive(Default)]
pub struct MemoryLogStore {
    state: Mutex<MemoryState>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn unknown_partition(topic: &str, partition: Partition) -> BrokerError {
    BrokerError::Storage(format!("partition {partition} does not exist in '{topic}'"))
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn create_topic(&self, topic: &str, partitions: Partition) -> Result<(), BrokerError> {
        let mut state = self.state();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
        Ok(())
    }

    async fn partitions(&self, topic: &str) -> Result<Option<Partition>, BrokerError> {
        Ok(self.state().topics.get(topic).map(|p| p.len() as Partition))
    }

    async fn append(
        &self,
        topic: &str,
        partition: Partition,
        key: &str,
        value: &[u8],
    ) -> Result<Offset, BrokerError> {
        let mut state = self.state();
        let log = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?
            .get_mut(partition as usize)
            .ok_or_else(|| unknown_partition(topic, partition))?;
        log.push((key.to_string(), value.to_vec()));
        Ok(log.len() as Offset - 1)
    }

    async fn read(
        &self,
        topic: &str,
        partition: Partition,
        from: Offset,
        limit: usize,
    ) -> Result<Vec<Record>, BrokerError> {
        let state = self.state();
        let log = state
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?
            .get(partition as usize)
            .ok_or_else(|| unknown_partition(topic, partition))?;

        Ok(log
            .iter()
            .enumerate()
            .skip(from.max(0) as usize)
            .take(limit)
            .map(|(offset, (key, value))| Record {
                topic: topic.to_string(),
                partition,
                offset: offset as Offset,
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: Partition,
    ) -> Result<Option<Offset>, BrokerError> {
        Ok(self
            .state()
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied())
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: Partition,
        next_offset: Offset,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        let position = state
            .offsets
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(next_offset);
        *position = (*position).max(next_offset);
        Ok(())
    }

    async fn join(&self, group: &str, topic: &str) -> Result<ConsumerId, BrokerError> {
        let mut state = self.state();
        state.last_member += 1;
        let id = ConsumerId(state.last_member);

        let group = state
            .groups
            .entry((group.to_string(), topic.to_string()))
            .or_default();
        group.members.insert(id, Instant::now());
        group.generation += 1;
        Ok(id)
    }

    async fn heartbeat(
        &self,
        group: &str,
        topic: &str,
        member: ConsumerId,
        session_timeout: Duration,
    ) -> Result<Membership, BrokerError> {
        let now = Instant::now();
        let mut state = self.state();
        let group = state
            .groups
            .entry((group.to_string(), topic.to_string()))
            .or_default();

        let before = group.members.len();
        group
            .members
            .retain(|id, seen| *id == member || now.duration_since(*seen) <= session_timeout);
        let expired = before - group.members.len();
        let rejoined = group.members.insert(member, now).is_none();
        if expired > 0 || rejoined {
            group.generation += 1;
        }
        Ok(group.membership())
    }

    async fn leave(
        &self,
        group: &str,
        topic: &str,
        member: ConsumerId,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        if let Some(group) = state.groups.get_mut(&(group.to_string(), topic.to_string())) {
            if group.members.remove(&member).is_some() {
                group.generation += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read_window() {
        let store = MemoryLogStore::new();
        store.create_topic("t", 2).await.unwrap();

        for i in 0..5u8 {
            assert_eq!(store.append("t", 1, "k", &[i]).await.unwrap(), i as Offset);
        }

        let records = store.read("t", 1, 2, 2).await.unwrap();
        let offsets: Vec<Offset> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
        assert_eq!(records[0].value, vec![2]);
        assert!(store.read("t", 0, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_topic_keeps_existing_partitions() {
        let store = MemoryLogStore::new();
        store.create_topic("t", 3).await.unwrap();
        store.create_topic("t", 8).await.unwrap();
        assert_eq!(store.partitions("t").await.unwrap(), Some(3));
        assert_eq!(store.partitions("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_never_moves_backwards() {
        let store = MemoryLogStore::new();
        store.commit("g", "t", 0, 10).await.unwrap();
        store.commit("g", "t", 0, 4).await.unwrap();
        assert_eq!(store.committed("g", "t", 0).await.unwrap(), Some(10));
        assert_eq!(store.committed("other", "t", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_append_to_unknown_topic_fails() {
        let store = MemoryLogStore::new();
        assert!(matches!(
            store.append("nope", 0, "k", b"v").await,
            Err(BrokerError::UnknownTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_members_expire_without_heartbeats() {
        let store = MemoryLogStore::new();
        let a = store.join("g", "t").await.unwrap();
        let b = store.join("g", "t").await.unwrap();
        assert!(a < b);

        let timeout = Duration::from_millis(200);
        let both = store.heartbeat("g", "t", a, timeout).await.unwrap();
        assert_eq!(both.members, vec![a, b]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let alone = store.heartbeat("g", "t", a, timeout).await.unwrap();
        assert_eq!(alone.members, vec![a]);
        assert!(alone.generation > both.generation);

        // The expired member comes back on its next heartbeat.
        let back = store.heartbeat("g", "t", b, timeout).await.unwrap();
        assert_eq!(back.members, vec![a, b]);
        assert!(back.generation > alone.generation);
    }

    #[tokio::test]
    async fn test_leave_bumps_generation_once() {
        let store = MemoryLogStore::new();
        let a = store.join("g", "t").await.unwrap();
        let b = store.join("g", "t").await.unwrap();
        let timeout = Duration::from_secs(30);
        let before = store.heartbeat("g", "t", a, timeout).await.unwrap().generation;

        store.leave("g", "t", b).await.unwrap();
        store.leave("g", "t", b).await.unwrap();

        let after = store.heartbeat("g", "t", a, timeout).await.unwrap();
        assert_eq!(after.members, vec![a]);
        assert_eq!(after.generation, before + 1);
    }
}
