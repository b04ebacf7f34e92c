//! Runtime of the tally word count pipeline.
//!
//! Two independent clients talk to the broker:
//!
//! - [`SourceProducer`] publishes every non-empty line of an input to a topic
//! - [`WordCounter`] consumes that topic as part of a group, counts words
//!   and periodically emits an [`AggregationSnapshot`] to a [`SnapshotSink`]
//!
//! The counter commits an offset only after the snapshot covering the
//! message was emitted, giving at-least-once counting: a restart may
//! re-count messages, but never drops one.
//!
//! [`AggregationSnapshot`]: tally_core::AggregationSnapshot

mod counter;
mod producer;
mod sink;
mod state;
mod stats;
mod worker;

pub use counter::{WordCountConfig, WordCounter};
pub use producer::{
    FailurePolicy, InputSource, ProducerConfig, ProducerError, ProducerSummary, PublishOutcome,
    SourceProducer,
};
pub use sink::{MemorySink, SnapshotSink, TopicSink, WriterSink};
pub use state::ConsumerState;
pub use stats::{CounterStats, CounterStatsSnapshot};
