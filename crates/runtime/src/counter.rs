//! Word counter: the consuming side of the pipeline.
//!
//! A single dispatcher loop owns the broker consumer. It routes each message
//! to the worker of its partition, and on every flush trigger (interval,
//! buffered message count, partition revocation, shutdown) runs a flush
//! barrier across all workers:
//!
//! 1. Every worker acknowledges with its highest pending offset and pauses
//! 2. The shared store is snapshotted and the snapshot emitted
//! 3. In windowed mode the store is reset
//! 4. Workers are released to commit their partitions
//! 5. A checkpoint of the emitted offsets (and cumulative counts) is saved
//!
//! An offset is therefore never committed before the snapshot containing
//! its message was emitted. A crash between emit and commit replays the
//! message, which can only raise counts.

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tally_checkpoint::{
    BarrierRound, Checkpoint, CheckpointStorage, CommitOutcome, FlushConfig, FlushStats,
};
use tally_connectors::{MessageConsumer, RebalanceEvent, RetryPolicy};
use tally_core::{
    AggregationSnapshot, BrokerMessage, ConfigError, CountingMode, FlushError, OffsetCheckpoint,
    TopicPartition,
};
use tally_state::CountStore;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::sink::SnapshotSink;
use crate::state::{ConsumerState, StateTracker};
use crate::stats::{CounterStats, CounterStatsSnapshot};
use crate::worker::{PartitionWorker, WorkerHandle, WorkerMessage};

/// Configuration for the word counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordCountConfig {
    /// Consumer group the counter joins.
    pub group_id: String,
    /// Topics to consume.
    pub topics: Vec<String>,
    pub mode: CountingMode,
    pub flush: FlushConfig,
    /// Upper bound for a single receive call.
    pub poll_timeout: Duration,
    /// Capacity of each partition worker's channel.
    pub channel_capacity: usize,
    /// Backoff while the broker connection is down. Running out of attempts
    /// stops the counter.
    pub reconnect: RetryPolicy,
}

impl Default for WordCountConfig {
    fn default() -> Self {
        Self {
            group_id: "tally-wordcount".to_string(),
            topics: vec!["lines".to_string()],
            mode: CountingMode::Cumulative,
            flush: FlushConfig::default(),
            poll_timeout: Duration::from_millis(100),
            channel_capacity: 1024,
            reconnect: RetryPolicy {
                max_attempts: 10,
                ..RetryPolicy::default()
            },
        }
    }
}

impl WordCountConfig {
    pub fn new(group_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics: vec![topic.into()],
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: CountingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_flush(mut self, flush: FlushConfig) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, retry: RetryPolicy) -> Self {
        self.reconnect = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::Missing("group"));
        }
        if self.topics.is_empty() || self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Missing("topic"));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::invalid("poll-timeout", "must be greater than zero"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "channel-capacity",
                "must be greater than zero",
            ));
        }
        self.flush.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Interval,
    MessageThreshold,
    Rebalance,
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FlushReason::Interval => "interval",
            FlushReason::MessageThreshold => "message-threshold",
            FlushReason::Rebalance => "rebalance",
            FlushReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Dispatcher-owned state of one run.
struct RunContext {
    workers: HashMap<TopicPartition, WorkerHandle>,
    next_flush_id: u64,
    dispatched_since_flush: usize,
    /// Per partition, the last offset whose contribution was emitted.
    emitted: BTreeMap<TopicPartition, i64>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            workers: HashMap::new(),
            next_flush_id: 1,
            dispatched_since_flush: 0,
            emitted: BTreeMap::new(),
        }
    }
}

/// Consumes lines, counts words and periodically emits the counts.
pub struct WordCounter {
    config: WordCountConfig,
    consumer: Arc<dyn MessageConsumer>,
    sink: Arc<dyn SnapshotSink>,
    storage: Option<Arc<dyn CheckpointStorage>>,
    store: Arc<CountStore>,
    state: StateTracker,
    stats: Arc<CounterStats>,
    flush_stats: RwLock<FlushStats>,
}

impl WordCounter {
    pub fn new(
        config: WordCountConfig,
        consumer: Arc<dyn MessageConsumer>,
        sink: Arc<dyn SnapshotSink>,
    ) -> Self {
        let store = Arc::new(CountStore::new(config.mode));
        Self {
            config,
            consumer,
            sink,
            storage: None,
            store,
            state: StateTracker::new(),
            stats: Arc::new(CounterStats::default()),
            flush_stats: RwLock::new(FlushStats::default()),
        }
    }

    /// Persist a checkpoint after every flush and resume from the latest one
    /// on start. Required in cumulative mode: broker offsets alone would
    /// resume past messages whose counts were lost.
    pub fn with_checkpoint_storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config(&self) -> &WordCountConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<CountStore> {
        self.store.clone()
    }

    pub fn state(&self) -> ConsumerState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> CounterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn flush_stats(&self) -> FlushStats {
        self.flush_stats.read().clone()
    }

    /// Run until `shutdown` is cancelled or the broker connection is lost
    /// for good. A final flush is attempted in both cases.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let result = self.run_inner(&shutdown).await;
        self.state.set(ConsumerState::Stopped);

        let stats = self.stats.snapshot();
        let flush_stats = self.flush_stats();
        info!(
            messages = stats.messages,
            words = stats.words,
            malformed = stats.malformed,
            reconnects = stats.reconnects,
            flushes = flush_stats.completed_flushes,
            failed_flushes = flush_stats.failed_flushes,
            "Word counter stopped"
        );
        result
    }

    async fn run_inner(&self, shutdown: &CancellationToken) -> Result<()> {
        self.config.validate()?;
        if self.config.mode == CountingMode::Cumulative && self.storage.is_none() {
            return Err(ConfigError::invalid(
                "checkpoint-dir",
                "cumulative counting needs checkpoint storage to survive restarts",
            )
            .into());
        }
        let mut ctx = self.start().await?;

        let result = if shutdown.is_cancelled() {
            Ok(())
        } else {
            self.state.set(ConsumerState::Consuming);
            self.consume(&mut ctx, shutdown).await
        };

        self.state.set(ConsumerState::Stopping);
        if let Err(e) = self.flush(&mut ctx, FlushReason::Shutdown).await {
            error!(error = %e, "Final flush failed, unflushed messages will be replayed");
        }
        self.stop_workers(&mut ctx).await;
        result
    }

    async fn start(&self) -> Result<RunContext> {
        let mut ctx = RunContext::new();

        if let Some(storage) = &self.storage {
            match storage
                .load_latest()
                .await
                .context("loading latest checkpoint")?
            {
                Some(checkpoint) => self.resume_from(&checkpoint, &mut ctx).await,
                None => info!("No checkpoint found, starting from the group's committed offsets"),
            }
        }

        let topics = self.config.topics.clone();
        self.config
            .reconnect
            .run("subscribe", || self.consumer.subscribe(&topics))
            .await
            .context("subscribing to input topics")?;

        info!(
            group_id = %self.config.group_id,
            topics = ?self.config.topics,
            mode = %self.config.mode,
            "Word counter subscribed"
        );
        Ok(ctx)
    }

    async fn resume_from(&self, checkpoint: &Checkpoint, ctx: &mut RunContext) {
        ctx.next_flush_id = checkpoint.flush_id + 1;

        if self.config.mode == CountingMode::Cumulative {
            if checkpoint.has_counts() {
                self.store.restore(&checkpoint.counts, checkpoint.malformed);
            } else if checkpoint.mode == CountingMode::Windowed {
                info!(
                    flush_id = checkpoint.flush_id,
                    "Checkpoint was taken in windowed mode, starting with empty counts"
                );
            }
        }

        for offset in &checkpoint.offsets {
            if !self.config.topics.contains(&offset.topic) {
                continue;
            }
            let seeded = self
                .config
                .reconnect
                .run("seed group offset", || self.consumer.commit(offset))
                .await;
            if let Err(e) = seeded {
                warn!(
                    topic = %offset.topic,
                    partition = offset.partition,
                    offset = offset.offset,
                    error = %e,
                    "Could not seed group offset from checkpoint"
                );
            }
            ctx.emitted.insert(offset.topic_partition(), offset.offset);
        }

        info!(
            flush_id = checkpoint.flush_id,
            words = self.store.len(),
            partitions = ctx.emitted.len(),
            "Resumed from checkpoint"
        );
    }

    async fn consume(&self, ctx: &mut RunContext, shutdown: &CancellationToken) -> Result<()> {
        let mut rebalance = self.consumer.take_rebalance_events();
        let interval = self.config.flush.interval;
        let mut next_flush = Instant::now() + interval;
        let mut failures: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            if let Some(events) = rebalance.as_mut() {
                while let Ok(event) = events.try_recv() {
                    self.on_rebalance(ctx, event).await;
                }
            }

            let reason = if Instant::now() >= next_flush {
                Some(FlushReason::Interval)
            } else if self.threshold_reached(ctx) {
                Some(FlushReason::MessageThreshold)
            } else {
                None
            };
            if let Some(reason) = reason {
                if let Err(e) = self.flush(ctx, reason).await {
                    warn!(error = %e, "Flush failed, retrying at the next trigger");
                }
                next_flush = Instant::now() + interval;
                continue;
            }

            let wait = self
                .config
                .poll_timeout
                .min(next_flush.saturating_duration_since(Instant::now()));
            let received = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                received = self.consumer.recv(wait) => received,
            };

            match received {
                Ok(Some(message)) => {
                    failures = 0;
                    self.dispatch(ctx, message).await?;
                }
                Ok(None) => failures = 0,
                Err(e) if e.is_connection() => {
                    failures += 1;
                    self.stats.record_reconnect();
                    if failures >= self.config.reconnect.attempts() {
                        error!(error = %e, attempts = failures, "Broker connection lost, giving up");
                        return Err(e).context("broker connection lost");
                    }
                    let delay = self.config.reconnect.delay_for(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Broker connection lost, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => warn!(error = %e, "Receive failed"),
            }
        }
    }

    fn threshold_reached(&self, ctx: &RunContext) -> bool {
        self.config
            .flush
            .max_buffered_messages
            .is_some_and(|max| ctx.dispatched_since_flush >= max)
    }

    async fn dispatch(&self, ctx: &mut RunContext, message: BrokerMessage) -> Result<()> {
        let partition = message.topic_partition();
        let worker = match ctx.workers.entry(partition.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let worker = PartitionWorker::new(
                    partition.clone(),
                    self.consumer.clone(),
                    self.store.clone(),
                    self.config.flush.commit_retry.clone(),
                    self.stats.clone(),
                )
                .spawn(self.config.channel_capacity);
                entry.insert(worker)
            }
        };

        worker
            .tx
            .send(WorkerMessage::Record(message))
            .await
            .map_err(|_| anyhow!("partition worker for {partition} stopped unexpectedly"))?;
        ctx.dispatched_since_flush += 1;
        Ok(())
    }

    async fn on_rebalance(&self, ctx: &mut RunContext, event: RebalanceEvent) {
        match event {
            RebalanceEvent::Assigned(partitions) => {
                info!(partitions = ?partitions, "Partitions assigned");
            }
            RebalanceEvent::Revoked(partitions) => {
                info!(partitions = ?partitions, "Partitions revoked, flushing");
                if let Err(e) = self.flush(ctx, FlushReason::Rebalance).await {
                    warn!(error = %e, "Flush on revocation failed");
                }
                for partition in &partitions {
                    if let Some(worker) = ctx.workers.remove(partition) {
                        Self::stop_worker(partition, worker).await;
                    }
                    ctx.emitted.remove(partition);
                }
            }
        }
    }

    async fn flush(&self, ctx: &mut RunContext, reason: FlushReason) -> Result<(), FlushError> {
        let flush_id = ctx.next_flush_id;
        ctx.next_flush_id += 1;
        ctx.dispatched_since_flush = 0;

        let started = std::time::Instant::now();
        let resume = self.state.get() == ConsumerState::Consuming;
        if resume {
            self.state.set(ConsumerState::Flushing);
        }

        let result = self.flush_round(ctx, flush_id, reason).await;

        if resume {
            self.state.set(ConsumerState::Consuming);
        }

        let mut stats = self.flush_stats.write();
        match &result {
            Ok(()) => {
                stats.completed_flushes += 1;
                stats.last_flush_id = Some(flush_id);
                stats.last_flush_time = Some(tally_core::now_millis());
                stats.last_flush_duration = Some(started.elapsed());
            }
            Err(_) => stats.failed_flushes += 1,
        }
        result
    }

    async fn flush_round(
        &self,
        ctx: &mut RunContext,
        flush_id: u64,
        reason: FlushReason,
    ) -> Result<(), FlushError> {
        let flush = &self.config.flush;

        let mut round = BarrierRound::new(flush_id);
        let mut unreachable = 0;
        for (partition, worker) in &ctx.workers {
            let barrier = round.add(partition.clone());
            let sent = tokio::time::timeout(
                flush.barrier_timeout,
                worker.tx.send(WorkerMessage::Barrier(barrier)),
            )
            .await;
            if !matches!(sent, Ok(Ok(()))) {
                warn!(flush_id, %partition, "Could not deliver barrier to partition worker");
                round.remove(partition);
                unreachable += 1;
            }
        }
        if unreachable > 0 {
            return Err(FlushError::BarrierTimeout {
                flush_id,
                missing: unreachable,
                after: flush.barrier_timeout,
            });
        }

        let aligned = round.align(flush.barrier_timeout).await?;
        let buffered: usize = aligned.acks().iter().map(|a| a.buffered).sum();

        // Workers are paused: the store is quiescent until they are released.
        let snapshot = self.store.snapshot(flush_id);
        if !snapshot.is_empty() {
            trace!(snapshot = %snapshot_json(&snapshot), "Emitting snapshot");
            if let Err(e) = self.sink.emit(&snapshot).await {
                aligned.abort();
                let cause = format!("{e:#}");
                error!(
                    flush_id,
                    sink = self.sink.sink_id(),
                    error = %cause,
                    "Emitting snapshot failed"
                );
                return Err(FlushError::Emit {
                    flush_id,
                    reason: cause,
                });
            }
        }
        if self.store.mode() == CountingMode::Windowed {
            self.store.reset();
        }

        for ack in aligned.acks() {
            if let Some(offset) = ack.pending {
                ctx.emitted.insert(ack.partition.clone(), offset);
            }
        }

        let outcomes = aligned.commit(flush.commit_timeout).await;
        let committed = outcomes
            .iter()
            .filter(|o| matches!(o, CommitOutcome::Committed(_)))
            .count();
        let commit_failures = outcomes
            .iter()
            .filter(|o| matches!(o, CommitOutcome::Failed { .. }))
            .count();
        {
            let mut stats = self.flush_stats.write();
            stats.offsets_committed += committed as u64;
            stats.commit_failures += commit_failures as u64;
        }

        if let Some(storage) = &self.storage {
            let checkpoint = self.checkpoint_for(&snapshot, ctx);
            storage
                .save(&checkpoint)
                .await
                .map_err(|source| FlushError::Checkpoint { flush_id, source })?;
            if let Err(e) = storage.retain_latest(flush.num_retained).await {
                warn!(flush_id, error = %e, "Failed to delete old checkpoints");
            }
        }

        info!(
            flush_id,
            reason = %reason,
            words = snapshot.entries.len(),
            total = snapshot.total(),
            malformed = snapshot.malformed,
            buffered,
            committed,
            commit_failures,
            "Flush completed"
        );
        Ok(())
    }

    fn checkpoint_for(&self, snapshot: &AggregationSnapshot, ctx: &RunContext) -> Checkpoint {
        let cumulative = snapshot.mode == CountingMode::Cumulative;
        Checkpoint {
            flush_id: snapshot.flush_id,
            timestamp: snapshot.timestamp,
            mode: snapshot.mode,
            offsets: ctx
                .emitted
                .iter()
                .map(|(tp, offset)| OffsetCheckpoint::new(tp.topic.clone(), tp.partition, *offset))
                .collect(),
            counts: if cumulative {
                snapshot.entries.clone()
            } else {
                Vec::new()
            },
            malformed: if cumulative { snapshot.malformed } else { 0 },
        }
    }

    async fn stop_workers(&self, ctx: &mut RunContext) {
        for (partition, worker) in ctx.workers.drain() {
            Self::stop_worker(&partition, worker).await;
        }
    }

    async fn stop_worker(partition: &TopicPartition, worker: WorkerHandle) {
        let WorkerHandle { tx, join } = worker;
        drop(tx);
        if let Err(e) = join.await {
            error!(%partition, error = %e, "Partition worker failed");
        } else {
            debug!(%partition, "Partition worker joined");
        }
    }
}

fn snapshot_json(snapshot: &AggregationSnapshot) -> String {
    serde_json::to_string(snapshot).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}
