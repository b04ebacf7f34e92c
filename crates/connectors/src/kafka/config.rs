//! Kafka configuration types.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{OffsetReset, RetryPolicy};

/// Configuration for Kafka connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,

    /// Consumer group ID (for consumers).
    pub group_id: Option<String>,

    /// Topics to consume from (for consumers).
    pub topics: Vec<String>,

    /// Client ID.
    pub client_id: Option<String>,

    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,

    /// SASL username.
    pub sasl_username: Option<String>,

    /// SASL password.
    pub sasl_password: Option<String>,

    /// Where to start when the group has no committed offset.
    pub auto_offset_reset: OffsetReset,

    /// Session timeout.
    pub session_timeout_ms: Option<u64>,

    /// Heartbeat interval.
    pub heartbeat_interval_ms: Option<u64>,

    /// Maximum poll interval.
    pub max_poll_interval_ms: Option<u64>,

    /// Upper bound for any single broker call (metadata probe, produce, commit).
    pub operation_timeout: Duration,

    /// Backoff used while establishing the connection.
    pub connect_retry: RetryPolicy,

    /// Additional librdkafka properties.
    pub properties: HashMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: None,
            topics: Vec::new(),
            client_id: None,
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            auto_offset_reset: OffsetReset::Earliest,
            session_timeout_ms: Some(10000),
            heartbeat_interval_ms: Some(3000),
            max_poll_interval_ms: Some(300000),
            operation_timeout: Duration::from_secs(30),
            connect_retry: RetryPolicy::default(),
            properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_connect_retry(mut self, retry: RetryPolicy) -> Self {
        self.connect_retry = retry;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_security(
        mut self,
        protocol: impl Into<String>,
        mechanism: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        self.security_protocol = Some(protocol.into());
        self.sasl_mechanism = mechanism;
        self.sasl_username = username;
        self.sasl_password = password;
        self
    }

    /// Settings shared by producers and consumers.
    pub(crate) fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.bootstrap_servers);

        if let Some(client_id) = &self.client_id {
            client_config.set("client.id", client_id);
        }
        if let Some(protocol) = &self.security_protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &self.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &self.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(password) = &self.sasl_password {
            client_config.set("sasl.password", password);
        }

        client_config
    }

    /// Consumer settings. Auto commit is always off: offsets are committed
    /// only after the snapshot that covers them has been emitted.
    pub(crate) fn consumer_config(&self) -> ClientConfig {
        let mut client_config = self.client_config();
        client_config
            .set(
                "group.id",
                self.group_id.as_deref().unwrap_or("tally-wordcount"),
            )
            .set("auto.offset.reset", self.auto_offset_reset.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false");

        if let Some(session_timeout) = self.session_timeout_ms {
            client_config.set("session.timeout.ms", session_timeout.to_string());
        }
        if let Some(heartbeat) = self.heartbeat_interval_ms {
            client_config.set("heartbeat.interval.ms", heartbeat.to_string());
        }
        if let Some(max_poll) = self.max_poll_interval_ms {
            client_config.set("max.poll.interval.ms", max_poll.to_string());
        }

        for (key, value) in &self.properties {
            client_config.set(key, value);
        }
        client_config
    }

    /// Producer settings: acks from all replicas, idempotent delivery.
    pub(crate) fn producer_config(&self) -> ClientConfig {
        let mut client_config = self.client_config();
        client_config
            .set(
                "message.timeout.ms",
                self.operation_timeout.as_millis().to_string(),
            )
            .set("acks", "all")
            .set("enable.idempotence", "true");

        for (key, value) in &self.properties {
            client_config.set(key, value);
        }
        client_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let config = KafkaConfig::new("broker:9092")
            .with_group_id("wordcount")
            .with_offset_reset(OffsetReset::Latest)
            .with_property("enable.auto.commit", "false");
        let cc = config.consumer_config();
        assert_eq!(cc.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(cc.get("group.id"), Some("wordcount"));
        assert_eq!(cc.get("auto.offset.reset"), Some("latest"));
        assert_eq!(cc.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_producer_config_uses_operation_timeout() {
        let config =
            KafkaConfig::new("broker:9092").with_operation_timeout(Duration::from_secs(5));
        let cc = config.producer_config();
        assert_eq!(cc.get("message.timeout.ms"), Some("5000"));
        assert_eq!(cc.get("acks"), Some("all"));
    }
}
