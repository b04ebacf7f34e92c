//! Flush configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tally_connectors::RetryPolicy;
use tally_core::ConfigError;

/// Configuration for flush triggering and checkpoint retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Time between flushes.
    pub interval: Duration,
    /// Flush early once this many messages are pending commit. `None`
    /// flushes on the interval only.
    pub max_buffered_messages: Option<usize>,
    /// How long to wait for every partition worker to reach the barrier.
    pub barrier_timeout: Duration,
    /// Retries for each partition's offset commit.
    pub commit_retry: RetryPolicy,
    /// How long the coordinator waits for workers to report their commits.
    pub commit_timeout: Duration,
    /// Where checkpoints are written. `None` keeps offsets in the broker only.
    pub checkpoint_dir: Option<PathBuf>,
    /// Number of checkpoints to retain.
    pub num_retained: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_buffered_messages: None,
            barrier_timeout: Duration::from_secs(30),
            commit_retry: RetryPolicy::default().with_max_attempts(3),
            commit_timeout: Duration::from_secs(60),
            checkpoint_dir: None,
            num_retained: 3,
        }
    }
}

impl FlushConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn with_max_buffered_messages(mut self, max: usize) -> Self {
        self.max_buffered_messages = Some(max);
        self
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    pub fn with_commit_retry(mut self, retry: RetryPolicy) -> Self {
        self.commit_retry = retry;
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_num_retained(mut self, n: usize) -> Self {
        self.num_retained = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid(
                "flush-interval",
                "must be greater than zero",
            ));
        }
        if self.max_buffered_messages == Some(0) {
            return Err(ConfigError::invalid(
                "flush-max-messages",
                "must be greater than zero",
            ));
        }
        if self.barrier_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "barrier-timeout",
                "must be greater than zero",
            ));
        }
        if self.num_retained == 0 {
            return Err(ConfigError::invalid(
                "num-retained",
                "at least one checkpoint must be kept",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(FlushConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = FlushConfig::new(Duration::ZERO).validate().unwrap_err();
        assert!(err.to_string().contains("flush-interval"));
    }

    #[test]
    fn test_rejects_zero_message_threshold() {
        let config = FlushConfig::default().with_max_buffered_messages(0);
        assert!(config.validate().is_err());
    }
}
