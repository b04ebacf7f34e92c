//! Kafka consumer-group client.
//!
//! Revocations are forwarded from `pre_rebalance` without blocking the
//! rebalance. The word counter flushes when it next reads the event, which
//! is after librdkafka has handed the partitions over. Commits for revoked
//! partitions may then be rejected (the messages are replayed by the new
//! owner) or, if accepted, move the group offset back to the last emitted
//! position. Either way messages are re-counted, never lost.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    BrokerError, BrokerMessage, CommitError, ConnectionError, OffsetCheckpoint, TopicPartition,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{blocking_call, is_transport_error, KafkaConfig};
use crate::{MessageConsumer, RebalanceEvent};

/// Consumer context that forwards partition assignment changes.
pub struct RebalanceContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

fn partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let revoked = partitions(tpl);
                info!(partitions = ?revoked, "Partitions revoked");
                let _ = self.events.send(RebalanceEvent::Revoked(revoked));
            }
            Rebalance::Assign(tpl) => {
                debug!(count = tpl.count(), "Partition assignment pending");
            }
            Rebalance::Error(e) => {
                warn!(error = %e, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let assigned = partitions(tpl);
            info!(partitions = ?assigned, "Partitions assigned");
            let _ = self.events.send(RebalanceEvent::Assigned(assigned));
        }
    }
}

/// A Kafka consumer group member with manual offset management.
pub struct KafkaConsumer {
    config: KafkaConfig,
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RebalanceEvent>>>,
}

impl KafkaConsumer {
    /// Create the consumer and verify the cluster is reachable, retrying
    /// with the configured backoff.
    pub async fn connect(config: KafkaConfig) -> Result<Self, ConnectionError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = RebalanceContext { events: events_tx };

        let consumer: StreamConsumer<RebalanceContext> = config
            .consumer_config()
            .create_with_context(context)
            .map_err(|e| ConnectionError::Unreachable {
                brokers: config.bootstrap_servers.clone(),
                reason: e.to_string(),
            })?;
        let consumer = Arc::new(consumer);

        let timeout = config.operation_timeout;
        config
            .connect_retry
            .run("kafka consumer connect", || {
                let consumer = consumer.clone();
                let brokers = config.bootstrap_servers.clone();
                async move {
                    blocking_call("metadata probe", timeout, move || {
                        consumer.fetch_metadata(None, timeout).map(|_| ())
                    })
                    .await?
                    .map_err(|e| ConnectionError::Unreachable {
                        brokers,
                        reason: e.to_string(),
                    })
                }
            })
            .await?;

        info!(
            brokers = %config.bootstrap_servers,
            group_id = ?config.group_id,
            "Kafka consumer connected"
        );

        Ok(Self {
            config,
            consumer,
            events: Mutex::new(Some(events_rx)),
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    fn to_message(message: &impl Message) -> BrokerMessage {
        BrokerMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            payload: message.payload().map(Bytes::copy_from_slice),
            timestamp: message.timestamp().to_millis().map(|t| t as u64),
        }
    }

    fn recv_error(e: KafkaError) -> BrokerError {
        if is_transport_error(&e) {
            ConnectionError::Lost(e.to_string()).into()
        } else {
            BrokerError::Receive(e.to_string())
        }
    }

    fn commit_error(checkpoint: &OffsetCheckpoint, e: KafkaError) -> BrokerError {
        if is_transport_error(&e) {
            CommitError::Connection(ConnectionError::Lost(e.to_string())).into()
        } else {
            CommitError::Rejected {
                topic: checkpoint.topic.clone(),
                partition: checkpoint.partition,
                offset: checkpoint.offset,
                reason: e.to_string(),
            }
            .into()
        }
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
        self.consumer.subscribe(&topics).map_err(|e| {
            BrokerError::from(ConnectionError::Unreachable {
                brokers: self.config.bootstrap_servers.clone(),
                reason: e.to_string(),
            })
        })?;

        info!(topics = ?topics, group_id = ?self.config.group_id, "Kafka consumer subscribed");
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(Self::to_message(&message))),
            Ok(Err(e)) => Err(Self::recv_error(e)),
        }
    }

    async fn commit(&self, checkpoint: &OffsetCheckpoint) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &checkpoint.topic,
            checkpoint.partition,
            Offset::Offset(checkpoint.resume_offset()),
        )
        .map_err(|e| Self::commit_error(checkpoint, e))?;

        let consumer = self.consumer.clone();
        let timeout = self.config.operation_timeout;
        let result = blocking_call("offset commit", timeout, move || {
            consumer.commit(&tpl, CommitMode::Sync)
        })
        .await
        .map_err(|e| match e {
            ConnectionError::Timeout { after, .. } => CommitError::Timeout { after },
            other => CommitError::Connection(other),
        })?;

        result.map_err(|e| Self::commit_error(checkpoint, e))?;
        debug!(
            topic = %checkpoint.topic,
            partition = checkpoint.partition,
            offset = checkpoint.offset,
            "Offset committed"
        );
        Ok(())
    }

    fn take_rebalance_events(&self) -> Option<mpsc::UnboundedReceiver<RebalanceEvent>> {
        self.events.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::types::RDKafkaErrorCode;

    #[test]
    fn test_recv_error_classification() {
        let down = KafkaConsumer::recv_error(KafkaError::MessageConsumption(
            RDKafkaErrorCode::AllBrokersDown,
        ));
        assert!(down.is_connection());

        let unknown = KafkaConsumer::recv_error(KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ));
        assert!(!unknown.is_connection());
        assert!(matches!(unknown, BrokerError::Receive(_)));
    }
}
