//! In-process broker with topics, partitions and consumer groups.
//!
//! Behaves like a single-node broker for the subset of semantics the
//! pipeline relies on: keyed partitioning, per-partition offsets, per-group
//! committed offsets and `earliest`/`latest` reset. Faults can be injected to
//! exercise retry and recovery paths.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    now_millis, BrokerError, BrokerMessage, CommitError, ConnectionError, DeliveryAck,
    OffsetCheckpoint, PublishError, TopicPartition,
};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::{MessageConsumer, MessageProducer, OffsetReset, RebalanceEvent};

#[derive(Default)]
struct Faults {
    produce: u32,
    commit: u32,
    recv: u32,
    recv_errors: u32,
}

struct BrokerState {
    default_partitions: i32,
    topics: HashMap<String, Vec<Vec<BrokerMessage>>>,
    /// (group, partition) -> next offset to consume
    committed: HashMap<(String, TopicPartition), i64>,
    faults: Faults,
    round_robin: usize,
}

impl BrokerState {
    fn partitions_mut(&mut self, topic: &str) -> &mut Vec<Vec<BrokerMessage>> {
        let n = self.default_partitions.max(1) as usize;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); n])
    }
}

/// Shared handle to an in-memory broker. Cloning yields another handle to
/// the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    /// Create a broker whose auto-created topics have `default_partitions`
    /// partitions.
    pub fn new(default_partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                default_partitions,
                topics: HashMap::new(),
                committed: HashMap::new(),
                faults: Faults::default(),
                round_robin: 0,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Create `topic` with an explicit partition count. No-op if it exists.
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let n = partitions.max(1) as usize;
        self.state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); n]);
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
        }
    }

    pub fn consumer(&self, group_id: impl Into<String>, reset: OffsetReset) -> MemoryConsumer {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        MemoryConsumer {
            broker: self.clone(),
            group_id: group_id.into(),
            reset,
            subscription: Mutex::new(Vec::new()),
            positions: Mutex::new(HashMap::new()),
            cursor: Mutex::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// All messages of `topic`, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|parts| parts.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Offset one past the last message of a partition.
    pub fn end_offset(&self, tp: &TopicPartition) -> i64 {
        self.state
            .lock()
            .topics
            .get(&tp.topic)
            .and_then(|parts| parts.get(tp.partition as usize))
            .map(|p| p.len() as i64)
            .unwrap_or(0)
    }

    /// Next offset to consume for `group` on `tp`, if the group committed one.
    pub fn committed(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        self.state
            .lock()
            .committed
            .get(&(group.to_string(), tp.clone()))
            .copied()
    }

    /// Make the next `n` produce calls fail.
    pub fn fail_next_produces(&self, n: u32) {
        self.state.lock().faults.produce = n;
    }

    /// Make the next `n` commit calls fail.
    pub fn fail_next_commits(&self, n: u32) {
        self.state.lock().faults.commit = n;
    }

    /// Make the next `n` receive calls fail as if the connection dropped.
    pub fn disconnect_next_receives(&self, n: u32) {
        self.state.lock().faults.recv = n;
        self.notify.notify_waiters();
    }

    /// Make the next `n` receive calls fail with a non-connection error.
    pub fn fail_next_receives(&self, n: u32) {
        self.state.lock().faults.recv_errors = n;
        self.notify.notify_waiters();
    }

    fn append(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<DeliveryAck, BrokerError> {
        let mut state = self.state.lock();
        if state.faults.produce > 0 {
            state.faults.produce -= 1;
            return Err(PublishError::Connection {
                topic: topic.to_string(),
                source: ConnectionError::Lost("injected produce failure".into()),
            }
            .into());
        }

        let rr = state.round_robin;
        state.round_robin = state.round_robin.wrapping_add(1);

        let parts = state.partitions_mut(topic);
        let partition = match key {
            Some(k) => {
                let mut hasher = DefaultHasher::new();
                k.hash(&mut hasher);
                (hasher.finish() % parts.len() as u64) as usize
            }
            None => rr % parts.len(),
        };

        let log = &mut parts[partition];
        let offset = log.len() as i64;
        log.push(BrokerMessage {
            topic: topic.to_string(),
            partition: partition as i32,
            offset,
            key: key.map(Bytes::copy_from_slice),
            payload: Some(Bytes::copy_from_slice(payload)),
            timestamp: Some(now_millis()),
        });
        drop(state);

        self.notify.notify_waiters();
        Ok(DeliveryAck {
            topic: topic.to_string(),
            partition: partition as i32,
            offset,
        })
    }

    /// Append a raw message, bypassing encoding. Used to plant malformed
    /// payloads.
    pub fn append_raw(&self, topic: &str, partition: i32, payload: Option<Bytes>) -> i64 {
        let mut state = self.state.lock();
        let parts = state.partitions_mut(topic);
        let idx = (partition.max(0) as usize).min(parts.len() - 1);
        let log = &mut parts[idx];
        let offset = log.len() as i64;
        log.push(BrokerMessage {
            topic: topic.to_string(),
            partition: idx as i32,
            offset,
            key: None,
            payload,
            timestamp: Some(now_millis()),
        });
        drop(state);
        self.notify.notify_waiters();
        offset
    }
}

pub struct MemoryProducer {
    broker: MemoryBroker,
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    async fn produce(
        &self,
        topic: &str,
        payload: &[u8],
        key: Option<&[u8]>,
    ) -> Result<DeliveryAck, BrokerError> {
        self.broker.append(topic, key, payload)
    }
}

/// A consumer group member on a [`MemoryBroker`].
///
/// A group is assumed to have a single member: the consumer owns every
/// partition of its subscribed topics.
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    reset: OffsetReset,
    subscription: Mutex<Vec<String>>,
    positions: Mutex<HashMap<TopicPartition, i64>>,
    cursor: Mutex<usize>,
    events_tx: mpsc::UnboundedSender<RebalanceEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RebalanceEvent>>>,
}

impl MemoryConsumer {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Simulate the group coordinator revoking every partition this consumer
    /// has read from. Positions are rewound to the committed offsets, as
    /// after a real reassignment.
    pub fn revoke_all(&self) {
        let revoked: Vec<TopicPartition> = {
            let mut positions = self.positions.lock();
            let tps: BTreeSet<TopicPartition> = positions.keys().cloned().collect();
            positions.clear();
            tps.into_iter().collect()
        };
        let _ = self.events_tx.send(RebalanceEvent::Revoked(revoked));
    }

    fn try_next(&self) -> Result<Option<BrokerMessage>, BrokerError> {
        let mut state = self.broker.state.lock();
        if state.faults.recv > 0 {
            state.faults.recv -= 1;
            return Err(ConnectionError::Lost("injected disconnect".into()).into());
        }
        if state.faults.recv_errors > 0 {
            state.faults.recv_errors -= 1;
            return Err(BrokerError::Receive("injected receive failure".into()));
        }

        let subscription = self.subscription.lock().clone();
        let mut candidates = Vec::new();
        for topic in &subscription {
            let parts = state.partitions_mut(topic);
            for p in 0..parts.len() {
                candidates.push(TopicPartition::new(topic.clone(), p as i32));
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut positions = self.positions.lock();
        let mut cursor = self.cursor.lock();
        for i in 0..candidates.len() {
            let tp = &candidates[(*cursor + i) % candidates.len()];
            let log = &state.topics[&tp.topic][tp.partition as usize];
            let position = *positions.entry(tp.clone()).or_insert_with(|| {
                state
                    .committed
                    .get(&(self.group_id.clone(), tp.clone()))
                    .copied()
                    .unwrap_or(match self.reset {
                        OffsetReset::Earliest => 0,
                        OffsetReset::Latest => log.len() as i64,
                    })
            });

            if let Some(msg) = log.get(position as usize) {
                positions.insert(tp.clone(), position + 1);
                *cursor = (*cursor + i + 1) % candidates.len();
                return Ok(Some(msg.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        *self.subscription.lock() = topics.to_vec();

        let assigned: Vec<TopicPartition> = {
            let mut state = self.broker.state.lock();
            topics
                .iter()
                .flat_map(|t| {
                    let n = state.partitions_mut(t).len();
                    (0..n).map(move |p| TopicPartition::new(t.clone(), p as i32))
                })
                .collect()
        };
        debug!(group_id = %self.group_id, partitions = assigned.len(), "Memory consumer subscribed");
        let _ = self.events_tx.send(RebalanceEvent::Assigned(assigned));
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent append
            // cannot slip between the check and the wait.
            let notified = self.broker.notify.notified();
            if let Some(msg) = self.try_next()? {
                return Ok(Some(msg));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&self, checkpoint: &OffsetCheckpoint) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        if state.faults.commit > 0 {
            state.faults.commit -= 1;
            return Err(CommitError::Rejected {
                topic: checkpoint.topic.clone(),
                partition: checkpoint.partition,
                offset: checkpoint.offset,
                reason: "injected commit failure".into(),
            }
            .into());
        }

        state.committed.insert(
            (self.group_id.clone(), checkpoint.topic_partition()),
            checkpoint.resume_offset(),
        );
        Ok(())
    }

    fn take_rebalance_events(&self) -> Option<mpsc::UnboundedReceiver<RebalanceEvent>> {
        self.events_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_produce_and_consume_in_partition_order() {
        let broker = MemoryBroker::new(1);
        let producer = broker.producer();
        for line in ["a", "b", "c"] {
            producer.produce("lines", line.as_bytes(), None).await.unwrap();
        }

        let consumer = broker.consumer("g", OffsetReset::Earliest);
        consumer.subscribe(&["lines".to_string()]).await.unwrap();

        let mut seen = Vec::new();
        while let Some(msg) = consumer.recv(WAIT).await.unwrap() {
            seen.push((msg.offset, msg.decode_line().unwrap().to_string()));
        }
        assert_eq!(
            seen,
            vec![(0, "a".to_string()), (1, "b".to_string()), (2, "c".to_string())]
        );
    }

    #[tokio::test]
    async fn test_same_key_lands_on_same_partition() {
        let broker = MemoryBroker::new(4);
        let producer = broker.producer();
        let a = producer.produce("t", b"x", Some(b"k")).await.unwrap();
        let b = producer.produce("t", b"y", Some(b"k")).await.unwrap();
        assert_eq!(a.partition, b.partition);
        assert_eq!(b.offset, a.offset + 1);
    }

    #[tokio::test]
    async fn test_commit_sets_resume_position() {
        let broker = MemoryBroker::new(1);
        let producer = broker.producer();
        for i in 0..10 {
            producer.produce("t", format!("m{i}").as_bytes(), None).await.unwrap();
        }

        let first = broker.consumer("g", OffsetReset::Earliest);
        first
            .commit(&OffsetCheckpoint::new("t", 0, 5))
            .await
            .unwrap();
        assert_eq!(broker.committed("g", &TopicPartition::new("t", 0)), Some(6));

        let second = broker.consumer("g", OffsetReset::Earliest);
        second.subscribe(&["t".to_string()]).await.unwrap();
        let msg = second.recv(WAIT).await.unwrap().unwrap();
        assert_eq!(msg.offset, 6);
    }

    #[tokio::test]
    async fn test_latest_reset_skips_backlog() {
        let broker = MemoryBroker::new(1);
        let producer = broker.producer();
        producer.produce("t", b"old", None).await.unwrap();

        let consumer = broker.consumer("g", OffsetReset::Latest);
        consumer.subscribe(&["t".to_string()]).await.unwrap();
        assert!(consumer.recv(WAIT).await.unwrap().is_none());

        producer.produce("t", b"new", None).await.unwrap();
        let msg = consumer.recv(WAIT).await.unwrap().unwrap();
        assert_eq!(msg.decode_line().unwrap(), "new");
    }

    #[tokio::test]
    async fn test_recv_wakes_on_produce() {
        let broker = MemoryBroker::new(1);
        let consumer = broker.consumer("g", OffsetReset::Earliest);
        consumer.subscribe(&["t".to_string()]).await.unwrap();

        let producer = broker.producer();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("t", b"late", None).await.unwrap();
        });

        let msg = consumer.recv(Duration::from_secs(5)).await.unwrap();
        assert!(msg.is_some());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let broker = MemoryBroker::new(1);
        let producer = broker.producer();
        broker.fail_next_produces(1);
        assert!(producer.produce("t", b"x", None).await.is_err());
        assert!(producer.produce("t", b"x", None).await.is_ok());

        let consumer = broker.consumer("g", OffsetReset::Earliest);
        consumer.subscribe(&["t".to_string()]).await.unwrap();
        broker.disconnect_next_receives(1);
        let err = consumer.recv(WAIT).await.unwrap_err();
        assert!(err.is_connection());
        broker.fail_next_receives(1);
        let err = consumer.recv(WAIT).await.unwrap_err();
        assert!(!err.is_connection());
        assert!(consumer.recv(WAIT).await.unwrap().is_some());

        broker.fail_next_commits(1);
        let chk = OffsetCheckpoint::new("t", 0, 0);
        assert!(consumer.commit(&chk).await.is_err());
        assert!(consumer.commit(&chk).await.is_ok());
    }

    #[tokio::test]
    async fn test_rebalance_events() {
        let broker = MemoryBroker::new(2);
        let consumer = broker.consumer("g", OffsetReset::Earliest);
        let mut events = consumer.take_rebalance_events().unwrap();
        assert!(consumer.take_rebalance_events().is_none());

        consumer.subscribe(&["t".to_string()]).await.unwrap();
        match events.recv().await.unwrap() {
            RebalanceEvent::Assigned(tps) => assert_eq!(tps.len(), 2),
            other => panic!("unexpected event {other:?}"),
        }

        broker.producer().produce("t", b"x", None).await.unwrap();
        consumer.recv(WAIT).await.unwrap();
        consumer.revoke_all();
        assert!(matches!(events.recv().await.unwrap(), RebalanceEvent::Revoked(_)));
    }
}
