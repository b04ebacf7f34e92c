//! Flush barrier between the dispatcher and the partition workers.
//!
//! One [`BarrierRound`] is opened per flush. The dispatcher adds one
//! participant per partition worker and sends the returned [`Barrier`] down
//! that worker's channel. Channels are FIFO, so by the time a worker sees its
//! barrier it has applied every message routed to it before the flush.
//!
//! Dropping either half releases the other: a worker whose release sender
//! is dropped treats it as [`Release::Abort`] and keeps its pending offset.

use std::time::Duration;
use tally_core::{FlushError, OffsetCheckpoint, TopicPartition};
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// A worker's answer to a barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierAck {
    pub partition: TopicPartition,
    /// Highest offset processed but not yet committed.
    pub pending: Option<i64>,
    /// Messages processed since the last successful commit.
    pub buffered: usize,
}

/// What the coordinator tells a paused worker to do.
#[derive(Debug)]
pub enum Release {
    /// The snapshot covering the pending offset was emitted; commit it and
    /// report the outcome.
    Commit(oneshot::Sender<CommitOutcome>),
    /// The flush failed; keep the pending offset and resume.
    Abort,
}

/// Result of a worker's commit after release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(OffsetCheckpoint),
    NothingPending(TopicPartition),
    Failed {
        partition: TopicPartition,
        offset: i64,
        reason: String,
    },
}

/// Worker-side half of a barrier.
#[derive(Debug)]
pub struct Barrier {
    flush_id: u64,
    ack: oneshot::Sender<BarrierAck>,
    release: oneshot::Receiver<Release>,
}

impl Barrier {
    pub fn flush_id(&self) -> u64 {
        self.flush_id
    }

    /// Acknowledge the barrier and wait to be released.
    pub async fn acknowledge(self, ack: BarrierAck) -> Release {
        let partition = ack.partition.clone();
        if self.ack.send(ack).is_err() {
            debug!(flush_id = self.flush_id, %partition, "Barrier abandoned before ack");
            return Release::Abort;
        }
        self.release.await.unwrap_or(Release::Abort)
    }
}

struct Participant {
    partition: TopicPartition,
    ack: oneshot::Receiver<BarrierAck>,
    release: oneshot::Sender<Release>,
}

/// Coordinator-side state of one flush barrier.
pub struct BarrierRound {
    flush_id: u64,
    participants: Vec<Participant>,
}

impl BarrierRound {
    pub fn new(flush_id: u64) -> Self {
        Self {
            flush_id,
            participants: Vec::new(),
        }
    }

    /// Register a worker and return the barrier to send to it.
    pub fn add(&mut self, partition: TopicPartition) -> Barrier {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        self.participants.push(Participant {
            partition,
            ack: ack_rx,
            release: release_tx,
        });
        Barrier {
            flush_id: self.flush_id,
            ack: ack_tx,
            release: release_rx,
        }
    }

    /// Drop a worker whose barrier could not be delivered.
    pub fn remove(&mut self, partition: &TopicPartition) {
        self.participants.retain(|p| &p.partition != partition);
    }

    /// Wait until every worker has acknowledged, bounded by `timeout`.
    ///
    /// On timeout every worker is released with [`Release::Abort`].
    pub async fn align(self, timeout: Duration) -> Result<AlignedRound, FlushError> {
        let deadline = Instant::now() + timeout;
        let mut acks = Vec::with_capacity(self.participants.len());
        let mut releases = Vec::with_capacity(self.participants.len());
        let mut missing = Vec::new();

        for participant in self.participants {
            match timeout_at(deadline, participant.ack).await {
                Ok(Ok(ack)) => {
                    acks.push(ack);
                    releases.push((participant.partition, participant.release));
                }
                Ok(Err(_)) | Err(_) => missing.push(participant.partition),
            }
        }

        if !missing.is_empty() {
            warn!(
                flush_id = self.flush_id,
                missing = ?missing,
                "Partition workers did not reach the barrier"
            );
            return Err(FlushError::BarrierTimeout {
                flush_id: self.flush_id,
                missing: missing.len(),
                after: timeout,
            });
        }

        Ok(AlignedRound { acks, releases })
    }
}

/// A barrier every worker has acknowledged. Workers stay paused until it is
/// committed or aborted.
pub struct AlignedRound {
    acks: Vec<BarrierAck>,
    releases: Vec<(TopicPartition, oneshot::Sender<Release>)>,
}

impl AlignedRound {
    pub fn acks(&self) -> &[BarrierAck] {
        &self.acks
    }

    /// Release every worker to commit and collect the outcomes. Workers
    /// commit concurrently.
    pub async fn commit(self, timeout: Duration) -> Vec<CommitOutcome> {
        let mut waiting = Vec::with_capacity(self.releases.len());
        for ((partition, release), ack) in self.releases.into_iter().zip(self.acks) {
            let (done_tx, done_rx) = oneshot::channel::<CommitOutcome>();
            // A worker that already went away leaves `done_rx` closed.
            let _ = release.send(Release::Commit(done_tx));
            waiting.push((partition, ack.pending, done_rx));
        }

        let deadline = Instant::now() + timeout;
        let mut outcomes = Vec::with_capacity(waiting.len());
        for (partition, pending, done) in waiting {
            let outcome = match timeout_at(deadline, done).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) | Err(_) => match pending {
                    Some(offset) => CommitOutcome::Failed {
                        partition,
                        offset,
                        reason: "worker did not report its commit".to_string(),
                    },
                    None => CommitOutcome::NothingPending(partition),
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Release every worker without committing.
    pub fn abort(self) {
        for (_, release) in self.releases {
            let _ = release.send(Release::Abort);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(partition: i32, pending: Option<i64>) -> BarrierAck {
        BarrierAck {
            partition: TopicPartition::new("lines", partition),
            pending,
            buffered: pending.map(|_| 1).unwrap_or(0),
        }
    }

    #[tokio::test]
    async fn test_round_aligns_and_commits() {
        let mut round = BarrierRound::new(1);
        let b0 = round.add(TopicPartition::new("lines", 0));
        let b1 = round.add(TopicPartition::new("lines", 1));

        let worker = |barrier: Barrier, partition: i32, pending: Option<i64>| {
            tokio::spawn(async move {
                match barrier.acknowledge(ack(partition, pending)).await {
                    Release::Commit(done) => {
                        let tp = TopicPartition::new("lines", partition);
                        let outcome = match pending {
                            Some(offset) => CommitOutcome::Committed(OffsetCheckpoint::new(
                                "lines", partition, offset,
                            )),
                            None => CommitOutcome::NothingPending(tp),
                        };
                        let _ = done.send(outcome);
                        true
                    }
                    Release::Abort => false,
                }
            })
        };
        let w0 = worker(b0, 0, Some(7));
        let w1 = worker(b1, 1, None);

        let aligned = round.align(Duration::from_secs(1)).await.unwrap();
        assert_eq!(aligned.acks().len(), 2);
        assert_eq!(aligned.acks()[0].pending, Some(7));

        let outcomes = aligned.commit(Duration::from_secs(1)).await;
        assert_eq!(
            outcomes,
            vec![
                CommitOutcome::Committed(OffsetCheckpoint::new("lines", 0, 7)),
                CommitOutcome::NothingPending(TopicPartition::new("lines", 1)),
            ]
        );
        assert!(w0.await.unwrap());
        assert!(w1.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_acknowledged_workers() {
        let mut round = BarrierRound::new(3);
        let fast = round.add(TopicPartition::new("lines", 0));
        let _stuck = round.add(TopicPartition::new("lines", 1));

        let worker = tokio::spawn(async move { fast.acknowledge(ack(0, Some(2))).await });

        let err = round.align(Duration::from_millis(100)).await.err().unwrap();
        match err {
            FlushError::BarrierTimeout {
                flush_id, missing, ..
            } => {
                assert_eq!(flush_id, 3);
                assert_eq!(missing, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(worker.await.unwrap(), Release::Abort));
    }

    #[tokio::test]
    async fn test_abort_releases_workers() {
        let mut round = BarrierRound::new(1);
        let barrier = round.add(TopicPartition::new("lines", 0));
        let worker = tokio::spawn(async move { barrier.acknowledge(ack(0, Some(1))).await });

        let aligned = round.align(Duration::from_secs(1)).await.unwrap();
        aligned.abort();
        assert!(matches!(worker.await.unwrap(), Release::Abort));
    }

    #[tokio::test]
    async fn test_silent_worker_counts_as_failed_commit() {
        let mut round = BarrierRound::new(1);
        let barrier = round.add(TopicPartition::new("lines", 0));
        let worker = tokio::spawn(async move {
            // Drops the outcome sender without reporting.
            let _ = barrier.acknowledge(ack(0, Some(4))).await;
        });

        let aligned = round.align(Duration::from_secs(1)).await.unwrap();
        let outcomes = aligned.commit(Duration::from_secs(1)).await;
        worker.await.unwrap();
        assert!(matches!(
            &outcomes[0],
            CommitOutcome::Failed { offset: 4, .. }
        ));
    }
}
