//! Flush coordination and checkpointing for the word count consumer.
//!
//! A flush is a Chandy-Lamport style cut taken across the partition workers:
//! - The dispatcher stops reading and sends a [`Barrier`] down every worker
//!   channel
//! - Each worker drains what was queued before the barrier, acknowledges
//!   with its highest pending offset and pauses
//! - Once every worker has acknowledged, the shared store is snapshotted and
//!   the snapshot emitted
//! - Workers are then released to commit their own partitions
//! - The committed offsets (and, in cumulative mode, the counts) are
//!   persisted as a [`Checkpoint`]
//!
//! Checkpoints are what a restarted consumer resumes from.

mod barrier;
mod config;
pub mod storage;
mod types;

pub use barrier::{AlignedRound, Barrier, BarrierAck, BarrierRound, CommitOutcome, Release};
pub use config::FlushConfig;
pub use storage::{CheckpointStorage, FsCheckpointStorage, MemoryCheckpointStorage};
pub use types::{Checkpoint, FlushStats};
