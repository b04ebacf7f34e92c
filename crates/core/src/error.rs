//! Error taxonomy for the pipeline.
//!
//! Broker-facing failures (`ConnectionError`, `PublishError`, `CommitError`)
//! are transient: callers retry them with backoff before giving up.
//! `DecodeError` is permanent for the message that produced it and
//! `ConfigError` is fatal at startup.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to establish or keep a broker session.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("broker {brokers} unreachable: {reason}")]
    Unreachable { brokers: String, reason: String },

    #[error("connection lost: {0}")]
    Lost(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("client not connected")]
    NotConnected,
}

/// Failure to publish a single message.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("publish to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("publish to {topic} timed out after {after:?}")]
    Timeout { topic: String, after: Duration },

    #[error("publish to {topic} failed: {source}")]
    Connection {
        topic: String,
        #[source]
        source: ConnectionError,
    },
}

/// Failure to commit a consumer offset.
#[derive(Debug, Clone, Error)]
pub enum CommitError {
    #[error("commit of {topic}[{partition}]@{offset} rejected: {reason}")]
    Rejected {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("commit timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("commit failed: {0}")]
    Connection(#[from] ConnectionError),
}

/// A message whose payload cannot be turned into a line of text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty payload at {topic}[{partition}]@{offset}")]
    Empty {
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("payload at {topic}[{partition}]@{offset} is not UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 {
        topic: String,
        partition: i32,
        offset: i64,
        valid_up_to: usize,
    },
}

/// Invalid startup configuration. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Any error surfaced by a broker client.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    /// A receive failed while the session stayed up, e.g. an unknown topic
    /// or a partition-level error. Polling can continue.
    #[error("receive failed: {0}")]
    Receive(String),
}

impl BrokerError {
    /// Whether the error indicates the session itself is gone, as opposed
    /// to a single operation failing.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::Publish(PublishError::Connection { .. })
                | BrokerError::Commit(CommitError::Connection(_))
        )
    }
}

/// Failure reading or writing durable checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint encoding failed: {0}")]
    Encode(String),

    #[error("checkpoint at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// A flush that did not complete. The flush is retried on the next trigger;
/// nothing it touched is committed.
#[derive(Debug, Error)]
pub enum FlushError {
    #[error("flush {flush_id}: {missing} partition worker(s) did not reach the barrier within {after:?}")]
    BarrierTimeout {
        flush_id: u64,
        missing: usize,
        after: Duration,
    },

    #[error("flush {flush_id}: emitting snapshot failed: {reason}")]
    Emit { flush_id: u64, reason: String },

    #[error("flush {flush_id}: {source}")]
    Checkpoint {
        flush_id: u64,
        #[source]
        source: CheckpointError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_classification() {
        let lost: BrokerError = ConnectionError::Lost("socket closed".into()).into();
        assert!(lost.is_connection());

        let rejected: BrokerError = PublishError::Rejected {
            topic: "lines".into(),
            reason: "message too large".into(),
        }
        .into();
        assert!(!rejected.is_connection());

        let commit: BrokerError = CommitError::Connection(ConnectionError::NotConnected).into();
        assert!(commit.is_connection());

        let receive = BrokerError::Receive("unknown topic or partition".into());
        assert!(!receive.is_connection());
    }

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::invalid("flush-interval", "must be greater than zero");
        assert_eq!(
            err.to_string(),
            "invalid value for `flush-interval`: must be greater than zero"
        );
    }
}
