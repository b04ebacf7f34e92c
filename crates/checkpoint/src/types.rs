//! Checkpoint and flush statistics types.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tally_core::{CountEntry, CountingMode, OffsetCheckpoint, Timestamp, TopicPartition};

/// Durable record of a completed flush.
///
/// `offsets` holds, per partition, the last offset whose contribution is in
/// an emitted snapshot. The broker commit may have failed or still lag
/// behind; on restart these offsets are seeded back to the group. `counts` is
/// empty in windowed mode: a restarted windowed consumer begins a fresh
/// window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub flush_id: u64,
    pub timestamp: Timestamp,
    pub mode: CountingMode,
    pub offsets: Vec<OffsetCheckpoint>,
    pub counts: Vec<CountEntry>,
    pub malformed: u64,
}

impl Checkpoint {
    pub fn offset_for(&self, partition: &TopicPartition) -> Option<i64> {
        self.offsets
            .iter()
            .find(|o| o.topic == partition.topic && o.partition == partition.partition)
            .map(|o| o.offset)
    }

    /// Whether this checkpoint carries counts to restore.
    pub fn has_counts(&self) -> bool {
        self.mode == CountingMode::Cumulative && (!self.counts.is_empty() || self.malformed > 0)
    }
}

/// Statistics about flushing.
#[derive(Debug, Default, Clone, Serialize)]
pub struct FlushStats {
    pub completed_flushes: u64,
    pub failed_flushes: u64,
    pub commit_failures: u64,
    pub offsets_committed: u64,
    pub last_flush_id: Option<u64>,
    pub last_flush_time: Option<Timestamp>,
    pub last_flush_duration: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_lookup() {
        let checkpoint = Checkpoint {
            flush_id: 4,
            timestamp: 0,
            mode: CountingMode::Cumulative,
            offsets: vec![
                OffsetCheckpoint::new("lines", 0, 5),
                OffsetCheckpoint::new("lines", 1, 12),
            ],
            counts: vec![CountEntry::new("the", 3)],
            malformed: 0,
        };

        assert_eq!(checkpoint.offset_for(&TopicPartition::new("lines", 1)), Some(12));
        assert_eq!(checkpoint.offset_for(&TopicPartition::new("lines", 2)), None);
        assert_eq!(checkpoint.offset_for(&TopicPartition::new("other", 0)), None);
        assert!(checkpoint.has_counts());
    }

    #[test]
    fn test_windowed_checkpoint_has_no_counts() {
        let checkpoint = Checkpoint {
            flush_id: 1,
            timestamp: 0,
            mode: CountingMode::Windowed,
            offsets: vec![OffsetCheckpoint::new("lines", 0, 0)],
            counts: Vec::new(),
            malformed: 0,
        };
        assert!(!checkpoint.has_counts());
    }
}
