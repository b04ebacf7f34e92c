//! Broker clients for the word count pipeline.
//!
//! The pipeline only talks to a broker through two traits:
//!
//! - [`MessageProducer`]: publish a payload to a topic and wait for the ack
//! - [`MessageConsumer`]: subscribe as part of a consumer group, receive
//!   messages one at a time and commit processed offsets
//!
//! ## Available Clients
//!
//! - **Kafka** (feature `kafka`, enabled by default): librdkafka through `rdkafka`
//! - **Memory**: an in-process broker with partitions, consumer groups and
//!   fault injection, used by tests and the `--broker memory` demo mode
//!
//! Every call carries a timeout. Connection establishment is retried with
//! exponential backoff ([`RetryPolicy`]); per-operation retries are left to
//! callers, which know whether a failure is skippable.
//!
//! ## Example
//!
//! ```ignore
//! use tally_connectors::kafka::{KafkaConfig, KafkaConsumer};
//!
//! let config = KafkaConfig::new("localhost:9092")
//!     .with_group_id("wordcount")
//!     .with_topics(vec!["lines".to_string()]);
//!
//! let consumer = KafkaConsumer::connect(config).await?;
//! consumer.subscribe(&["lines".to_string()]).await?;
//! ```

#[cfg(feature = "kafka")]
pub mod kafka;

pub mod memory;
mod retry;

pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tally_core::{
    BrokerError, BrokerMessage, ConfigError, DeliveryAck, OffsetCheckpoint, TopicPartition,
};
use tokio::sync::mpsc;

/// Where a consumer group starts when it has no committed offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(ConfigError::invalid(
                "offset-reset",
                format!("expected `earliest` or `latest`, got `{other}`"),
            )),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partition ownership change reported by a group consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
}

/// Publishing half of a broker client.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Publish one message and wait for the broker acknowledgment.
    async fn produce(
        &self,
        topic: &str,
        payload: &[u8],
        key: Option<&[u8]>,
    ) -> Result<DeliveryAck, BrokerError>;

    /// Wait until every in-flight message is acknowledged.
    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Consuming half of a broker client, bound to one consumer group.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Join the group and subscribe to the given topics.
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next message. `Ok(None)` means nothing
    /// arrived in time.
    async fn recv(&self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError>;

    /// Durably record `checkpoint` as processed for this group. Consumption
    /// of the partition resumes at `checkpoint.resume_offset()`.
    async fn commit(&self, checkpoint: &OffsetCheckpoint) -> Result<(), BrokerError>;

    /// Take the stream of rebalance notifications. Returns `None` if the
    /// client does not report rebalances or the stream was already taken.
    fn take_rebalance_events(&self) -> Option<mpsc::UnboundedReceiver<RebalanceEvent>> {
        None
    }
}
