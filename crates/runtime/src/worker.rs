//! Partition workers.
//!
//! One worker task per assigned partition. The worker counts the words of
//! every message routed to it and remembers the highest offset it has
//! processed. It only ever commits that offset when released by a flush
//! barrier, i.e. after the snapshot holding its contribution was emitted.

use std::sync::Arc;
use tally_checkpoint::{Barrier, BarrierAck, CommitOutcome, Release};
use tally_connectors::{MessageConsumer, RetryPolicy};
use tally_core::{BrokerMessage, OffsetCheckpoint, TopicPartition};
use tally_operators::WordSplitter;
use tally_state::CountStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stats::CounterStats;

#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Record(BrokerMessage),
    Barrier(Barrier),
}

/// Dispatcher-side handle of a running worker.
pub(crate) struct WorkerHandle {
    pub(crate) tx: mpsc::Sender<WorkerMessage>,
    pub(crate) join: JoinHandle<()>,
}

pub(crate) struct PartitionWorker {
    partition: TopicPartition,
    consumer: Arc<dyn MessageConsumer>,
    store: Arc<CountStore>,
    splitter: WordSplitter,
    commit_retry: RetryPolicy,
    stats: Arc<CounterStats>,
    pending: Option<i64>,
    buffered: usize,
}

impl PartitionWorker {
    pub(crate) fn new(
        partition: TopicPartition,
        consumer: Arc<dyn MessageConsumer>,
        store: Arc<CountStore>,
        commit_retry: RetryPolicy,
        stats: Arc<CounterStats>,
    ) -> Self {
        Self {
            partition,
            consumer,
            store,
            splitter: WordSplitter::new(),
            commit_retry,
            stats,
            pending: None,
            buffered: 0,
        }
    }

    pub(crate) fn spawn(self, capacity: usize) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(capacity);
        let join = tokio::spawn(self.run(rx));
        WorkerHandle { tx, join }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WorkerMessage>) {
        debug!(partition = %self.partition, "Partition worker started");
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Record(record) => self.process(record),
                WorkerMessage::Barrier(barrier) => self.on_barrier(barrier).await,
            }
        }

        // Uncommitted work is replayed by whoever owns the partition next.
        info!(
            partition = %self.partition,
            uncommitted = ?self.pending,
            "Partition worker stopped"
        );
    }

    fn process(&mut self, record: BrokerMessage) {
        match record.decode_line() {
            Ok(line) => {
                let words = self.store.increment_all(self.splitter.split(line));
                self.stats.record_message(words);
            }
            Err(e) => {
                warn!(error = %e, "Malformed message");
                self.store.record_malformed();
                self.stats.record_malformed();
            }
        }

        self.pending = Some(self.pending.map_or(record.offset, |p| p.max(record.offset)));
        self.buffered += 1;
    }

    async fn on_barrier(&mut self, barrier: Barrier) {
        let flush_id = barrier.flush_id();
        let ack = BarrierAck {
            partition: self.partition.clone(),
            pending: self.pending,
            buffered: self.buffered,
        };

        match barrier.acknowledge(ack).await {
            Release::Commit(done) => {
                let outcome = self.commit().await;
                let _ = done.send(outcome);
            }
            Release::Abort => {
                debug!(flush_id, partition = %self.partition, "Flush aborted, keeping pending offset");
            }
        }
    }

    async fn commit(&mut self) -> CommitOutcome {
        let Some(offset) = self.pending else {
            return CommitOutcome::NothingPending(self.partition.clone());
        };
        let checkpoint =
            OffsetCheckpoint::new(self.partition.topic.clone(), self.partition.partition, offset);

        let consumer = &self.consumer;
        let result = self
            .commit_retry
            .run("offset commit", || consumer.commit(&checkpoint))
            .await;

        match result {
            Ok(()) => {
                debug!(partition = %self.partition, offset, "Offset committed");
                self.pending = None;
                self.buffered = 0;
                CommitOutcome::Committed(checkpoint)
            }
            Err(e) => {
                warn!(
                    partition = %self.partition,
                    offset,
                    error = %e,
                    "Offset commit failed, keeping it pending for the next flush"
                );
                CommitOutcome::Failed {
                    partition: self.partition.clone(),
                    offset,
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tally_checkpoint::BarrierRound;
    use tally_connectors::memory::MemoryBroker;
    use tally_connectors::OffsetReset;

    fn record(offset: i64, payload: Option<&'static [u8]>) -> BrokerMessage {
        BrokerMessage {
            topic: "lines".to_string(),
            partition: 0,
            offset,
            key: None,
            payload: payload.map(Bytes::from_static),
            timestamp: None,
        }
    }

    fn worker(broker: &MemoryBroker, store: Arc<CountStore>) -> WorkerHandle {
        PartitionWorker::new(
            TopicPartition::new("lines", 0),
            Arc::new(broker.consumer("wordcount", OffsetReset::Earliest)),
            store,
            RetryPolicy::fixed(2, Duration::from_millis(1)),
            Arc::new(CounterStats::default()),
        )
        .spawn(16)
    }

    async fn flush(handle: &WorkerHandle, flush_id: u64) -> CommitOutcome {
        let mut round = BarrierRound::new(flush_id);
        let barrier = round.add(TopicPartition::new("lines", 0));
        handle.tx.send(WorkerMessage::Barrier(barrier)).await.unwrap();
        let aligned = round.align(Duration::from_secs(1)).await.unwrap();
        aligned
            .commit(Duration::from_secs(1))
            .await
            .pop()
            .unwrap()
    }

    #[tokio::test]
    async fn test_counts_and_commits_highest_offset() {
        let broker = MemoryBroker::new(1);
        let store = Arc::new(CountStore::default());
        let handle = worker(&broker, store.clone());

        for (offset, line) in [(0, &b"the cat"[..]), (1, &b"the dog"[..])] {
            handle
                .tx
                .send(WorkerMessage::Record(record(offset, Some(line))))
                .await
                .unwrap();
        }
        handle
            .tx
            .send(WorkerMessage::Record(record(2, None)))
            .await
            .unwrap();

        let outcome = flush(&handle, 1).await;
        assert_eq!(
            outcome,
            CommitOutcome::Committed(OffsetCheckpoint::new("lines", 0, 2))
        );
        assert_eq!(store.snapshot(1).count("the"), 2);
        assert_eq!(store.malformed(), 1);
        assert_eq!(
            broker.committed("wordcount", &TopicPartition::new("lines", 0)),
            Some(3)
        );

        assert_eq!(
            flush(&handle, 2).await,
            CommitOutcome::NothingPending(TopicPartition::new("lines", 0))
        );
    }

    #[tokio::test]
    async fn test_failed_commit_stays_pending() {
        let broker = MemoryBroker::new(1);
        let store = Arc::new(CountStore::default());
        let handle = worker(&broker, store);

        handle
            .tx
            .send(WorkerMessage::Record(record(0, Some(&b"hello"[..]))))
            .await
            .unwrap();

        broker.fail_next_commits(2);
        assert!(matches!(
            flush(&handle, 1).await,
            CommitOutcome::Failed { offset: 0, .. }
        ));

        assert_eq!(
            flush(&handle, 2).await,
            CommitOutcome::Committed(OffsetCheckpoint::new("lines", 0, 0))
        );
    }
}
