//! Apache Kafka client.
//!
//! - **Consumer**: group member with manual offset commits and rebalance
//!   notifications
//! - **Producer**: idempotent producer waiting for acks from all replicas
//!
//! Both clients probe the cluster metadata on connect, retrying with the
//! configured backoff, so a misconfigured or unreachable cluster surfaces as
//! a [`ConnectionError`](tally_core::ConnectionError) instead of a silent
//! stall.

mod config;
mod consumer;
mod producer;

pub use config::KafkaConfig;
pub use consumer::{KafkaConsumer, RebalanceContext};
pub use producer::KafkaProducer;

use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use std::time::Duration;
use tally_core::ConnectionError;

/// Whether a librdkafka error means the cluster cannot be reached.
pub(crate) fn is_transport_error(e: &KafkaError) -> bool {
    matches!(
        e.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::Resolve
                | RDKafkaErrorCode::BrokerNotAvailable
        )
    )
}

/// Run a blocking librdkafka call on the blocking pool, bounded by `timeout`.
pub(crate) async fn blocking_call<T, F>(
    operation: &'static str,
    timeout: Duration,
    f: F,
) -> Result<T, ConnectionError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join)) => Err(ConnectionError::Lost(format!("{operation} task failed: {join}"))),
        Err(_) => Err(ConnectionError::Timeout {
            operation,
            after: timeout,
        }),
    }
}
