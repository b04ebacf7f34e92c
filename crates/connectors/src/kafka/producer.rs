//! Kafka producer client.

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::time::Duration;
use tally_core::{BrokerError, ConnectionError, DeliveryAck, PublishError};
use tracing::{debug, info};

use super::{blocking_call, is_transport_error, KafkaConfig};
use crate::MessageProducer;

/// An idempotent Kafka producer.
pub struct KafkaProducer {
    config: KafkaConfig,
    producer: FutureProducer,
}

impl KafkaProducer {
    /// Create the producer and verify the cluster is reachable, retrying
    /// with the configured backoff.
    pub async fn connect(config: KafkaConfig) -> Result<Self, ConnectionError> {
        let producer: FutureProducer =
            config
                .producer_config()
                .create()
                .map_err(|e| ConnectionError::Unreachable {
                    brokers: config.bootstrap_servers.clone(),
                    reason: e.to_string(),
                })?;

        let timeout = config.operation_timeout;
        config
            .connect_retry
            .run("kafka producer connect", || {
                let producer = producer.clone();
                let brokers = config.bootstrap_servers.clone();
                async move {
                    blocking_call("metadata probe", timeout, move || {
                        producer.client().fetch_metadata(None, timeout).map(|_| ())
                    })
                    .await?
                    .map_err(|e| ConnectionError::Unreachable {
                        brokers,
                        reason: e.to_string(),
                    })
                }
            })
            .await?;

        info!(brokers = %config.bootstrap_servers, "Kafka producer connected");
        Ok(Self { config, producer })
    }

    fn publish_error(&self, topic: &str, e: KafkaError) -> PublishError {
        if e.rdkafka_error_code() == Some(RDKafkaErrorCode::MessageTimedOut) {
            PublishError::Timeout {
                topic: topic.to_string(),
                after: self.config.operation_timeout,
            }
        } else if is_transport_error(&e) {
            PublishError::Connection {
                topic: topic.to_string(),
                source: ConnectionError::Lost(e.to_string()),
            }
        } else {
            PublishError::Rejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn produce(
        &self,
        topic: &str,
        payload: &[u8],
        key: Option<&[u8]>,
    ) -> Result<DeliveryAck, BrokerError> {
        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic).payload(payload);
        if let Some(k) = key {
            record = record.key(k);
        }

        match self
            .producer
            .send(record, Timeout::After(self.config.operation_timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!(topic, partition, offset, "Message delivered to Kafka");
                Ok(DeliveryAck {
                    topic: topic.to_string(),
                    partition,
                    offset,
                })
            }
            Err((e, _)) => Err(self.publish_error(topic, e).into()),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        blocking_call("producer flush", timeout, move || producer.flush(Timeout::After(timeout)))
            .await?
            .map_err(|e| BrokerError::from(ConnectionError::Lost(e.to_string())))
    }
}
