//! In-memory partitioned log with consumer-group offset bookkeeping.
//!
//! Partition assignment is range-free and deterministic: with members sorted
//! by join order, partition `p` belongs to member `p % members`. Any join or
//! leave bumps the group generation; members then restart every assigned
//! partition from the group's committed offset, the way a Kafka rebalance does.

use super::{partition_for, BrokerRecord, Delivery, OutgoingRecord, RecordConsumer, RecordProducer};
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

type TopicPartition = (String, i32);

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
    headers: Vec<(String, String)>,
    timestamp: i64,
}

#[derive(Debug, Default)]
struct MemberState {
    generation: u64,
    positions: HashMap<TopicPartition, i64>,
    paused: HashSet<TopicPartition>,
}

#[derive(Debug, Default)]
struct GroupState {
    generation: u64,
    members: Vec<u64>,
    member_state: HashMap<u64, MemberState>,
    committed: HashMap<TopicPartition, i64>,
}

#[derive(Debug, Default)]
struct BrokerState {
    default_partitions: usize,
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<String, GroupState>,
    next_member_id: u64,
    produce_failures: u32,
    commit_failures: u32,
    poll_failures: VecDeque<BrokerError>,
    commits: Vec<(String, i32, i64)>,
}

impl BrokerState {
    fn partitions_mut(&mut self, topic: &str) -> &mut Vec<Vec<StoredRecord>> {
        let default = self.default_partitions.max(1);
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); default])
    }
}

/// Shared handle to an in-memory broker. Clones refer to the same log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Broker whose topics are auto-created with `partitions` partitions.
    pub fn new(partitions: usize) -> Self {
        let state = BrokerState {
            default_partitions: partitions.max(1),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.state
            .lock()
            .topics
            .insert(topic.to_string(), vec![Vec::new(); partitions.max(1)]);
    }

    /// Join `group` as a new member subscribed to `topic`.
    pub fn consumer(&self, group: &str, topic: &str) -> InMemoryConsumer {
        let mut state = self.state.lock();
        state.partitions_mut(topic);
        state.next_member_id += 1;
        let member_id = state.next_member_id;

        let group_state = state.groups.entry(group.to_string()).or_default();
        group_state.members.push(member_id);
        group_state.generation += 1;
        let member = MemberState {
            generation: group_state.generation,
            ..Default::default()
        };
        group_state.member_state.insert(member_id, member);

        InMemoryConsumer {
            broker: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            member_id,
        }
    }

    /// Fail the next `n` sends with a transient error.
    pub fn fail_next_produces(&self, n: u32) {
        self.state.lock().produce_failures = n;
    }

    /// Fail the next `n` commits with a transient error.
    pub fn fail_next_commits(&self, n: u32) {
        self.state.lock().commit_failures = n;
    }

    /// Make the next poll of any member return `err` instead of records.
    pub fn fail_next_poll(&self, err: BrokerError) {
        self.state.lock().poll_failures.push_back(err);
    }

    /// Every record currently in the topic, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<BrokerRecord> {
        let state = self.state.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter()
                    .enumerate()
                    .map(move |(offset, stored)| to_broker_record(topic, partition as i32, offset as i64, stored))
            })
            .collect()
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .groups
            .get(group)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)).copied())
    }

    /// Successful commits, in the order they happened.
    pub fn commits(&self) -> Vec<(String, i32, i64)> {
        self.state.lock().commits.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.len()
    }
}

fn to_broker_record(topic: &str, partition: i32, offset: i64, stored: &StoredRecord) -> BrokerRecord {
    BrokerRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: Some(stored.key.as_bytes().to_vec()),
        payload: if stored.payload.is_empty() {
            None
        } else {
            Some(stored.payload.clone())
        },
        headers: stored.headers.clone(),
        timestamp: Some(stored.timestamp),
    }
}

#[async_trait]
impl RecordProducer for InMemoryBroker {
    async fn send(&self, record: &OutgoingRecord) -> Result<Delivery, BrokerError> {
        let mut state = self.state.lock();
        if state.produce_failures > 0 {
            state.produce_failures -= 1;
            return Err(BrokerError::Transient("injected produce failure".to_string()));
        }

        let partitions = state.partitions_mut(&record.topic);
        let partition = partition_for(&record.key, partitions.len());
        let log = &mut partitions[partition as usize];
        log.push(StoredRecord {
            key: record.key.clone(),
            payload: record.payload.clone(),
            headers: record.headers.clone(),
            timestamp: Utc::now().timestamp_millis(),
        });

        Ok(Delivery {
            partition,
            offset: (log.len() - 1) as i64,
        })
    }

    async fn flush(&self, _timeout: Duration) -> Result<usize, BrokerError> {
        Ok(0)
    }

    async fn partition_count(&self, topic: &str) -> Result<usize, BrokerError> {
        Ok(self.state.lock().partitions_mut(topic).len())
    }
}

/// One member of a consumer group on an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    topic: String,
    member_id: u64,
}

impl InMemoryConsumer {
    pub fn member_id(&self) -> u64 {
        self.member_id
    }

    /// Partitions currently assigned to this member.
    pub fn assignment(&self) -> Vec<i32> {
        let state = self.broker.state.lock();
        let partition_count = state.topics.get(&self.topic).map_or(0, Vec::len);
        state
            .groups
            .get(&self.group)
            .map(|g| assigned_partitions(&g.members, self.member_id, partition_count))
            .unwrap_or_default()
    }

    fn fetch(&self, max_records: usize) -> Vec<BrokerRecord> {
        let mut guard = self.broker.state.lock();
        let state = &mut *guard;
        let Some(partitions) = state.topics.get(&self.topic) else {
            return Vec::new();
        };
        let Some(group) = state.groups.get_mut(&self.group) else {
            return Vec::new();
        };

        let assigned = assigned_partitions(&group.members, self.member_id, partitions.len());
        let generation = group.generation;
        let committed = &group.committed;
        let Some(member) = group.member_state.get_mut(&self.member_id) else {
            return Vec::new();
        };
        if member.generation != generation {
            member.generation = generation;
            member.positions.clear();
            member.paused.clear();
        }

        let mut batch = Vec::new();
        for partition in assigned {
            let tp = (self.topic.clone(), partition);
            if member.paused.contains(&tp) {
                continue;
            }
            let start = *member
                .positions
                .entry(tp.clone())
                .or_insert_with(|| committed.get(&tp).copied().unwrap_or(0));
            let log = &partitions[partition as usize];
            let mut offset = start;
            while (offset as usize) < log.len() && batch.len() < max_records {
                batch.push(to_broker_record(&self.topic, partition, offset, &log[offset as usize]));
                offset += 1;
            }
            member.positions.insert(tp, offset);
            if batch.len() >= max_records {
                break;
            }
        }
        batch
    }
}

fn assigned_partitions(members: &[u64], member_id: u64, partition_count: usize) -> Vec<i32> {
    let Some(index) = members.iter().position(|m| *m == member_id) else {
        return Vec::new();
    };
    (0..partition_count)
        .filter(|p| p % members.len() == index)
        .map(|p| p as i32)
        .collect()
}

#[async_trait]
impl RecordConsumer for InMemoryConsumer {
    async fn poll_batch(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        if let Some(err) = self.broker.state.lock().poll_failures.pop_front() {
            return Err(err);
        }
        let batch = self.fetch(max_records);
        if batch.is_empty() {
            tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
        }
        Ok(batch)
    }

    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(BrokerError::Transient("injected commit failure".to_string()));
        }
        let partition_count = state.topics.get(topic).map_or(0, Vec::len);
        let group = state
            .groups
            .get_mut(&self.group)
            .ok_or_else(|| BrokerError::Permanent(format!("unknown group {}", self.group)))?;
        let member = group
            .member_state
            .get(&self.member_id)
            .ok_or_else(|| BrokerError::Permanent("member has left the group".to_string()))?;
        // A member must poll again after a rebalance before its commits count
        if member.generation != group.generation {
            return Err(BrokerError::Permanent(format!(
                "illegal generation {} (group is at {})",
                member.generation, group.generation
            )));
        }
        if topic != self.topic
            || !assigned_partitions(&group.members, self.member_id, partition_count).contains(&partition)
        {
            return Err(BrokerError::Permanent(format!(
                "partition {}/{} is not assigned to this member",
                topic, partition
            )));
        }

        let tp = (topic.to_string(), partition);
        if let Some(&current) = group.committed.get(&tp) {
            if next_offset < current {
                return Err(BrokerError::Permanent(format!(
                    "commit {} would move {}/{} back from {}",
                    next_offset, topic, partition, current
                )));
            }
        }
        group.committed.insert(tp, next_offset);
        state.commits.push((topic.to_string(), partition, next_offset));
        Ok(())
    }

    async fn halt_partition(&self, topic: &str, partition: i32) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        if let Some(member) = state
            .groups
            .get_mut(&self.group)
            .and_then(|g| g.member_state.get_mut(&self.member_id))
        {
            member.paused.insert((topic.to_string(), partition));
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.broker.state.lock();
        if let Some(group) = state.groups.get_mut(&self.group) {
            group.members.retain(|m| *m != self.member_id);
            group.member_state.remove(&self.member_id);
            group.generation += 1;
        }
    }
}
