//! Core types shared across the pipeline.
//!
//! - [`BrokerMessage`]: a record as delivered by the broker
//! - [`OffsetCheckpoint`]: last durably processed position of a partition
//! - [`CountEntry`] / [`AggregationSnapshot`]: what a flush emits
//! - [`error`]: the error taxonomy used by every crate

pub mod error;

pub use error::{
    BrokerError, CheckpointError, CommitError, ConfigError, ConnectionError, DecodeError,
    FlushError, PublishError,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

/// Milliseconds since Unix epoch.
pub type Timestamp = u64;

/// Word under which malformed messages are reported in emitted output.
pub const MALFORMED_SENTINEL: &str = "__malformed__";

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A (topic, partition) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A message as delivered by the broker. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
    pub timestamp: Option<Timestamp>,
}

impl BrokerMessage {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Decode the payload as a line of UTF-8 text.
    ///
    /// Missing and zero-length payloads are rejected as [`DecodeError::Empty`].
    pub fn decode_line(&self) -> Result<&str, DecodeError> {
        let payload = match self.payload.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => {
                return Err(DecodeError::Empty {
                    topic: self.topic.clone(),
                    partition: self.partition,
                    offset: self.offset,
                })
            }
        };

        std::str::from_utf8(payload).map_err(|e| DecodeError::InvalidUtf8 {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            valid_up_to: e.valid_up_to(),
        })
    }
}

/// Broker acknowledgment of a produced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Last durably processed position of a partition.
///
/// `offset` is the offset of the last message whose contribution is part of
/// an emitted snapshot; consumption resumes at `offset + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetCheckpoint {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl OffsetCheckpoint {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Offset of the next message to consume.
    pub fn resume_offset(&self) -> i64 {
        self.offset + 1
    }
}

/// How the aggregation store behaves across flushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountingMode {
    /// Counts are never reset; every snapshot holds all-time totals.
    #[default]
    Cumulative,
    /// Counts are reset after each flush; a snapshot holds one window.
    Windowed,
}

impl FromStr for CountingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cumulative" => Ok(CountingMode::Cumulative),
            "windowed" => Ok(CountingMode::Windowed),
            other => Err(ConfigError::invalid(
                "mode",
                format!("expected `cumulative` or `windowed`, got `{other}`"),
            )),
        }
    }
}

impl fmt::Display for CountingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountingMode::Cumulative => f.write_str("cumulative"),
            CountingMode::Windowed => f.write_str("windowed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEntry {
    pub word: String,
    pub count: u64,
}

impl CountEntry {
    pub fn new(word: impl Into<String>, count: u64) -> Self {
        Self {
            word: word.into(),
            count,
        }
    }
}

/// Point-in-time copy of the aggregation store, taken at a flush boundary.
///
/// Entries are ordered by count descending, then word ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSnapshot {
    pub flush_id: u64,
    pub timestamp: Timestamp,
    pub mode: CountingMode,
    pub entries: Vec<CountEntry>,
    /// Messages that could not be decoded since the last reset.
    pub malformed: u64,
}

impl AggregationSnapshot {
    /// Count for a single word, zero if absent.
    pub fn count(&self, word: &str) -> u64 {
        self.entries
            .iter()
            .find(|e| e.word == word)
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Sum of all word counts. The malformed counter is not included.
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|e| e.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.malformed == 0
    }

    /// Output records as `word<TAB>count`, with the malformed sentinel last
    /// when any malformed messages were seen.
    pub fn records(&self) -> impl Iterator<Item = String> + '_ {
        let malformed = (self.malformed > 0)
            .then(|| format!("{}\t{}", MALFORMED_SENTINEL, self.malformed));
        self.entries
            .iter()
            .map(|e| format!("{}\t{}", e.word, e.count))
            .chain(malformed)
    }

    /// Write the snapshot as newline-delimited `word<TAB>count` records.
    pub fn write_tsv<W: Write>(&self, mut out: W) -> io::Result<()> {
        for record in self.records() {
            writeln!(out, "{record}")?;
        }
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: Option<&'static [u8]>) -> BrokerMessage {
        BrokerMessage {
            topic: "lines".into(),
            partition: 0,
            offset: 7,
            key: None,
            payload: payload.map(Bytes::from_static),
            timestamp: None,
        }
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(message(Some(&b"the cat"[..])).decode_line(), Ok("the cat"));
        assert!(matches!(
            message(None).decode_line(),
            Err(DecodeError::Empty { offset: 7, .. })
        ));
        assert!(matches!(
            message(Some(&b""[..])).decode_line(),
            Err(DecodeError::Empty { .. })
        ));
        assert!(matches!(
            message(Some(&b"ok\xff\xfe"[..])).decode_line(),
            Err(DecodeError::InvalidUtf8 { valid_up_to: 2, .. })
        ));
    }

    #[test]
    fn test_resume_offset() {
        let chk = OffsetCheckpoint::new("lines", 2, 5);
        assert_eq!(chk.resume_offset(), 6);
        assert_eq!(chk.topic_partition().to_string(), "lines[2]");
    }

    #[test]
    fn test_counting_mode_parse() {
        assert_eq!("Windowed".parse::<CountingMode>(), Ok(CountingMode::Windowed));
        assert_eq!(CountingMode::default(), CountingMode::Cumulative);
        assert!("hourly".parse::<CountingMode>().is_err());
    }

    #[test]
    fn test_snapshot_tsv() {
        let snapshot = AggregationSnapshot {
            flush_id: 1,
            timestamp: 0,
            mode: CountingMode::Cumulative,
            entries: vec![CountEntry::new("the", 2), CountEntry::new("cat", 1)],
            malformed: 3,
        };

        let mut out = Vec::new();
        snapshot.write_tsv(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "the\t2\ncat\t1\n__malformed__\t3\n"
        );
        assert_eq!(snapshot.total(), 3);
        assert_eq!(snapshot.count("the"), 2);
        assert_eq!(snapshot.count("dog"), 0);
    }

    #[test]
    fn test_snapshot_json() {
        let snapshot = AggregationSnapshot {
            flush_id: 4,
            timestamp: 1000,
            mode: CountingMode::Windowed,
            entries: vec![CountEntry::new("ran", 1)],
            malformed: 0,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["mode"], "windowed");
        assert_eq!(json["entries"][0]["word"], "ran");
    }
}
