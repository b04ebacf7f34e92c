//! Snapshot emission.
//!
//! A snapshot is emitted exactly once per successful flush, before any
//! offset it covers is committed. Sinks therefore only need at-least-once
//! behavior of their own: a failed emit aborts the flush and nothing is
//! committed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tally_connectors::{MessageProducer, RetryPolicy};
use tally_core::{AggregationSnapshot, MALFORMED_SENTINEL};
use tracing::{debug, info};

/// Destination for aggregation snapshots.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Emit a snapshot. An error aborts the flush.
    async fn emit(&self, snapshot: &AggregationSnapshot) -> Result<()>;

    /// Get the sink identifier.
    fn sink_id(&self) -> &str;
}

/// Writes snapshots as `word<TAB>count` lines.
pub struct WriterSink<W: Write + Send> {
    writer: Mutex<W>,
    sink_id: String,
}

impl WriterSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout(), "stdout")
    }
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W, sink_id: impl Into<String>) -> Self {
        Self {
            writer: Mutex::new(writer),
            sink_id: sink_id.into(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: Write + Send> SnapshotSink for WriterSink<W> {
    async fn emit(&self, snapshot: &AggregationSnapshot) -> Result<()> {
        let mut writer = self.writer.lock();
        snapshot
            .write_tsv(&mut *writer)
            .with_context(|| format!("writing snapshot {} to {}", snapshot.flush_id, self.sink_id))
    }

    fn sink_id(&self) -> &str {
        &self.sink_id
    }
}

/// Re-publishes every record of a snapshot to a topic, keyed by word.
pub struct TopicSink {
    producer: Arc<dyn MessageProducer>,
    topic: String,
    retry: RetryPolicy,
}

impl TopicSink {
    pub fn new(producer: Arc<dyn MessageProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn publish(&self, key: &str, record: &str) -> Result<()> {
        self.retry
            .run("publish snapshot record", || {
                self.producer
                    .produce(&self.topic, record.as_bytes(), Some(key.as_bytes()))
            })
            .await
            .with_context(|| format!("publishing `{key}` to {}", self.topic))?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotSink for TopicSink {
    async fn emit(&self, snapshot: &AggregationSnapshot) -> Result<()> {
        for entry in &snapshot.entries {
            let record = format!("{}\t{}", entry.word, entry.count);
            self.publish(&entry.word, &record).await?;
        }
        if snapshot.malformed > 0 {
            let record = format!("{}\t{}", MALFORMED_SENTINEL, snapshot.malformed);
            self.publish(MALFORMED_SENTINEL, &record).await?;
        }

        info!(
            flush_id = snapshot.flush_id,
            topic = %self.topic,
            records = snapshot.entries.len(),
            "Snapshot published"
        );
        Ok(())
    }

    fn sink_id(&self) -> &str {
        &self.topic
    }
}

/// Keeps emitted snapshots in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    snapshots: Arc<Mutex<Vec<AggregationSnapshot>>>,
    failures: Arc<Mutex<u32>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` emits fail.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock() = n;
    }

    pub fn snapshots(&self) -> Vec<AggregationSnapshot> {
        self.snapshots.lock().clone()
    }

    pub fn latest(&self) -> Option<AggregationSnapshot> {
        self.snapshots.lock().last().cloned()
    }
}

#[async_trait]
impl SnapshotSink for MemorySink {
    async fn emit(&self, snapshot: &AggregationSnapshot) -> Result<()> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("injected emit failure");
            }
        }
        debug!(flush_id = snapshot.flush_id, "Snapshot captured");
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }

    fn sink_id(&self) -> &str {
        "memory"
    }
}
