use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::kafka::client::{BrokerClient, BrokerError, PartitionClient, RebalanceListener, Wakeup};
use crate::kafka::types::{FetchedRecord, PartitionKey, PendingOffsets};
use crate::test_utils::lock;

/// Longest an empty mock poll sleeps
const IDLE_POLL: Duration = Duration::from_millis(5);

pub type MemberId = usize;

/// One successful commit of one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub member: MemberId,
    pub partition: PartitionKey,
    pub offset: i64,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    timestamp: i64,
    payload: Bytes,
}

#[derive(Default)]
struct BrokerState {
    logs: BTreeMap<PartitionKey, Vec<StoredRecord>>,
    committed: HashMap<PartitionKey, i64>,
    commit_log: Vec<CommitEntry>,
    /// Members in join order, with their subscribed topics
    members: Vec<(MemberId, Vec<String>)>,
    next_member: MemberId,
    generation: u64,
    /// Assignment of the current generation
    target: HashMap<MemberId, Vec<PartitionKey>>,
    /// Partitions each member holds right now
    owned: HashMap<MemberId, Vec<PartitionKey>>,
    failing_commits: usize,
}

impl BrokerState {
    /// Round-robin over the sorted partitions of the subscribed topics, in member join order
    fn reassign(&mut self) {
        self.generation += 1;
        self.target.clear();
        if self.members.is_empty() {
            return;
        }

        for (member, _) in &self.members {
            self.target.insert(*member, Vec::new());
        }
        let subscribed: HashSet<&str> = self
            .members
            .iter()
            .flat_map(|(_, topics)| topics.iter().map(String::as_str))
            .collect();

        let mut next = 0;
        for partition in self.logs.keys() {
            if !subscribed.contains(partition.topic()) {
                continue;
            }
            // skip members that did not subscribe to this topic
            for _ in 0..self.members.len() {
                let (member, topics) = &self.members[next % self.members.len()];
                next += 1;
                if topics.iter().any(|t| t == partition.topic()) {
                    if let Some(assigned) = self.target.get_mut(member) {
                        assigned.push(partition.clone());
                    }
                    break;
                }
            }
        }
    }

    fn owned_by_other(&self, member: MemberId, partition: &PartitionKey) -> bool {
        self.owned
            .iter()
            .any(|(other, partitions)| *other != member && partitions.contains(partition))
    }
}

/// In-memory broker with consumer-group semantics, for tests.
///
/// Rebalances are eager: every membership change starts a new generation in which each member
/// first revokes everything it holds, and only receives its new assignment once no other
/// member still holds any of those partitions. Fetch positions of a new assignment start at the
/// committed offset, or at 0.
#[derive(Default)]
pub struct MockBroker {
    state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = lock(&self.state);
        for n in 0..partitions {
            state
                .logs
                .entry(PartitionKey::new(topic, n))
                .or_default();
        }
    }

    /// Appends a record and returns its offset
    pub fn produce(&self, topic: &str, partition: i32, payload: impl Into<Bytes>) -> i64 {
        let mut state = lock(&self.state);
        let log = state
            .logs
            .entry(PartitionKey::new(topic, partition))
            .or_default();
        log.push(StoredRecord {
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload: payload.into(),
        });
        log.len() as i64 - 1
    }

    pub fn committed_offset(&self, partition: &PartitionKey) -> Option<i64> {
        lock(&self.state).committed.get(partition).copied()
    }

    pub fn commit_log(&self) -> Vec<CommitEntry> {
        lock(&self.state).commit_log.clone()
    }

    pub fn log_end_offset(&self, partition: &PartitionKey) -> i64 {
        lock(&self.state)
            .logs
            .get(partition)
            .map(|log| log.len() as i64)
            .unwrap_or(0)
    }

    /// Makes the next `count` commits fail
    pub fn fail_next_commits(&self, count: usize) {
        lock(&self.state).failing_commits = count;
    }

    /// Starts a new generation without a membership change
    pub fn trigger_rebalance(&self) {
        lock(&self.state).reassign();
    }

    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    pub fn member_count(&self) -> usize {
        lock(&self.state).members.len()
    }

    /// Partitions a member holds right now
    pub fn owned_by(&self, member: MemberId) -> Vec<PartitionKey> {
        lock(&self.state)
            .owned
            .get(&member)
            .cloned()
            .unwrap_or_default()
    }

    fn join(&self, topics: &[String]) -> MemberId {
        let mut state = lock(&self.state);
        let member = state.next_member;
        state.next_member += 1;
        state.members.push((member, topics.to_vec()));
        state.reassign();
        member
    }

    fn leave(&self, member: MemberId) {
        let mut state = lock(&self.state);
        state.members.retain(|(m, _)| *m != member);
        state.owned.remove(&member);
        state.reassign();
    }

    fn commit(&self, member: MemberId, offsets: &PendingOffsets) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(BrokerError::Client("injected commit failure".to_string()));
        }

        let mut sorted: Vec<_> = offsets.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (partition, offset) in sorted {
            state.committed.insert(partition.clone(), offset.offset());
            state.commit_log.push(CommitEntry {
                member,
                partition: partition.clone(),
                offset: offset.offset(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct ClientState {
    member: Option<MemberId>,
    listener: Option<Arc<dyn RebalanceListener>>,
    generation: u64,
    assigned: Vec<PartitionKey>,
    positions: HashMap<PartitionKey, i64>,
    paused: HashSet<PartitionKey>,
}

/// Group member of a `MockBroker`
pub struct MockBrokerClient {
    broker: Arc<MockBroker>,
    state: Mutex<ClientState>,
    wakeup: Wakeup,
    max_records_per_partition: usize,
}

impl MockBrokerClient {
    pub fn new(broker: Arc<MockBroker>, max_records_per_partition: usize) -> Self {
        Self {
            broker,
            state: Mutex::new(ClientState::default()),
            wakeup: Wakeup::new(),
            max_records_per_partition,
        }
    }

    pub fn member_id(&self) -> Option<MemberId> {
        lock(&self.state).member
    }

    pub fn assignment(&self) -> Vec<PartitionKey> {
        lock(&self.state).assigned.clone()
    }

    pub fn is_paused(&self, partition: &PartitionKey) -> bool {
        lock(&self.state).paused.contains(partition)
    }

    pub fn position(&self, partition: &PartitionKey) -> Option<i64> {
        lock(&self.state).positions.get(partition).copied()
    }

    /// Runs the revoke and assign steps of a pending rebalance. Listener callbacks are made
    /// without holding any lock, since they call back into the client.
    fn rebalance(&self) {
        let (member, listener) = {
            let client = lock(&self.state);
            match (client.member, client.listener.clone()) {
                (Some(member), Some(listener)) => (member, listener),
                _ => return,
            }
        };

        let to_revoke = {
            let broker = lock(&self.broker.state);
            let client = lock(&self.state);
            (broker.generation > client.generation && !client.assigned.is_empty())
                .then(|| client.assigned.clone())
        };
        if let Some(partitions) = to_revoke {
            listener.on_partitions_revoked(&partitions, self);

            let mut broker = lock(&self.broker.state);
            let mut client = lock(&self.state);
            client.assigned.clear();
            client.positions.clear();
            client.paused.clear();
            broker.owned.remove(&member);
        }

        let assigned = {
            let mut broker = lock(&self.broker.state);
            let mut client = lock(&self.state);
            if broker.generation <= client.generation || !client.assigned.is_empty() {
                return;
            }
            let target = broker.target.get(&member).cloned().unwrap_or_default();
            if target.iter().any(|p| broker.owned_by_other(member, p)) {
                // previous owners have not revoked yet
                return;
            }

            broker.owned.insert(member, target.clone());
            client.generation = broker.generation;
            client.positions = target
                .iter()
                .map(|p| (p.clone(), broker.committed.get(p).copied().unwrap_or(0)))
                .collect();
            client.paused.clear();
            client.assigned = target.clone();
            target
        };

        if !assigned.is_empty() {
            listener.on_partitions_assigned(&assigned, self);
        }
    }

    fn fetch(&self) -> Vec<FetchedRecord> {
        let broker = lock(&self.broker.state);
        let mut client = lock(&self.state);
        let mut records = Vec::new();

        let mut partitions = client.assigned.clone();
        partitions.sort();
        for partition in partitions {
            if client.paused.contains(&partition) {
                continue;
            }
            let Some(log) = broker.logs.get(&partition) else {
                continue;
            };
            let position = client.positions.get(&partition).copied().unwrap_or(0);
            let end = (position as usize + self.max_records_per_partition).min(log.len());
            for offset in position as usize..end {
                let stored = &log[offset];
                records.push(FetchedRecord::new(
                    partition.clone(),
                    offset as i64,
                    Some(stored.timestamp),
                    stored.payload.clone(),
                ));
            }
            if end > position as usize {
                client.positions.insert(partition, end as i64);
            }
        }

        records
    }
}

impl PartitionClient for MockBrokerClient {
    fn pause(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        let mut client = lock(&self.state);
        client.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        let mut client = lock(&self.state);
        for partition in partitions {
            client.paused.remove(partition);
        }
        Ok(())
    }

    fn seek(&self, partition: &PartitionKey, offset: i64) -> Result<(), BrokerError> {
        let mut client = lock(&self.state);
        if !client.assigned.contains(partition) {
            return Err(BrokerError::Client(format!(
                "cannot seek unassigned partition {partition}"
            )));
        }
        client.positions.insert(partition.clone(), offset);
        Ok(())
    }

    fn commit(&self, offsets: &PendingOffsets) -> Result<(), BrokerError> {
        let member = lock(&self.state)
            .member
            .ok_or_else(|| BrokerError::Client("commit before subscribe".to_string()))?;
        self.broker.commit(member, offsets)
    }
}

impl BrokerClient for MockBrokerClient {
    fn subscribe(
        &self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError> {
        if lock(&self.state).member.is_some() {
            return Err(BrokerError::Client("already subscribed".to_string()));
        }
        let member = self.broker.join(topics);

        let mut client = lock(&self.state);
        client.listener = Some(listener);
        client.member = Some(member);
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<FetchedRecord>, BrokerError> {
        if self.wakeup.take() {
            return Err(BrokerError::Wakeup);
        }

        self.rebalance();

        let records = self.fetch();
        if records.is_empty() {
            std::thread::sleep(timeout.min(IDLE_POLL));
            if self.wakeup.take() {
                return Err(BrokerError::Wakeup);
            }
        }
        Ok(records)
    }

    fn wakeup_handle(&self) -> Wakeup {
        self.wakeup.clone()
    }

    fn close(self) {
        let member = lock(&self.state).member;
        if let Some(member) = member {
            self.broker.leave(member);
        }
    }
}
