//! Source producer: publishes text lines to the input topic.

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tally_connectors::{MessageProducer, RetryPolicy};
use tally_core::{BrokerError, ConfigError, DeliveryAck};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, error, info, warn};

/// What to do with a line whose publish still fails after all retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log, report a [`PublishOutcome::Skipped`] and continue.
    Skip,
    /// Report the error and end the run.
    #[default]
    Abort,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(FailurePolicy::Skip),
            "abort" => Ok(FailurePolicy::Abort),
            other => Err(ConfigError::invalid(
                "on-failure",
                format!("expected `skip` or `abort`, got `{other}`"),
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Skip => f.write_str("skip"),
            FailurePolicy::Abort => f.write_str("abort"),
        }
    }
}

/// Where lines come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    File(PathBuf),
    Stdin,
    Lines(Vec<String>),
}

impl InputSource {
    /// `-` means stdin, anything else is a file path.
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            InputSource::Stdin
        } else {
            InputSource::File(PathBuf::from(arg))
        }
    }

    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        InputSource::Lines(lines.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::File(path) => write!(f, "{}", path.display()),
            InputSource::Stdin => f.write_str("stdin"),
            InputSource::Lines(lines) => write!(f, "<{} lines>", lines.len()),
        }
    }
}

/// Configuration for the source producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Topic lines are published to.
    pub topic: String,
    /// Backoff for failed publishes. `max_attempts` is one more than the
    /// number of retries.
    pub retry: RetryPolicy,
    pub on_failure: FailurePolicy,
    /// How long to wait for in-flight deliveries at the end of a run.
    pub flush_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: "lines".to_string(),
            retry: RetryPolicy::default().with_max_attempts(4),
            on_failure: FailurePolicy::Abort,
            flush_timeout: Duration::from_secs(30),
        }
    }
}

impl ProducerConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.retry.max_attempts = retries.saturating_add(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Missing("topic"));
        }
        Ok(())
    }
}

/// Fatal producer errors.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("reading {input}: {source}")]
    Input {
        input: String,
        #[source]
        source: std::io::Error,
    },

    #[error("publishing line {line} failed: {source}")]
    Publish {
        line: u64,
        #[source]
        source: BrokerError,
    },
}

/// Result of publishing one line.
#[derive(Debug)]
pub enum PublishOutcome {
    Published { line: u64, ack: DeliveryAck },
    Skipped { line: u64, error: BrokerError },
}

/// Totals of a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProducerSummary {
    pub published: u64,
    pub skipped: u64,
}

enum LineReader {
    Reader(Lines<Pin<Box<dyn AsyncBufRead + Send>>>),
    Memory(std::vec::IntoIter<String>),
}

impl LineReader {
    async fn open(input: &InputSource) -> std::io::Result<Self> {
        let reader: Pin<Box<dyn AsyncBufRead + Send>> = match input {
            InputSource::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Box::pin(BufReader::new(file))
            }
            InputSource::Stdin => Box::pin(BufReader::new(tokio::io::stdin())),
            InputSource::Lines(lines) => return Ok(LineReader::Memory(lines.clone().into_iter())),
        };
        Ok(LineReader::Reader(reader.lines()))
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        match self {
            LineReader::Reader(lines) => lines.next_line().await,
            LineReader::Memory(lines) => Ok(lines.next()),
        }
    }
}

struct RunState {
    producer: Arc<dyn MessageProducer>,
    config: ProducerConfig,
    input: InputSource,
    reader: Option<LineReader>,
    line: u64,
    summary: ProducerSummary,
    done: bool,
}

impl RunState {
    async fn next(&mut self) -> Option<Result<PublishOutcome, ProducerError>> {
        if self.done {
            return None;
        }

        if self.reader.is_none() {
            match LineReader::open(&self.input).await {
                Ok(reader) => self.reader = Some(reader),
                Err(source) => return Some(Err(self.fail_input(source))),
            }
        }

        loop {
            let next = match self.reader.as_mut() {
                Some(reader) => reader.next_line().await,
                None => Ok(None),
            };
            let text = match next {
                Ok(Some(text)) => text,
                Ok(None) => {
                    self.finish().await;
                    return None;
                }
                Err(source) => return Some(Err(self.fail_input(source))),
            };

            let line = self.line;
            self.line += 1;
            if text.trim().is_empty() {
                debug!(line, "Skipping blank line");
                continue;
            }

            return Some(self.publish(line, &text).await);
        }
    }

    async fn publish(&mut self, line: u64, text: &str) -> Result<PublishOutcome, ProducerError> {
        let key = line.to_string();
        let producer = &self.producer;
        let topic = &self.config.topic;
        let result = self
            .config
            .retry
            .run("publish line", || {
                producer.produce(topic, text.as_bytes(), Some(key.as_bytes()))
            })
            .await;

        match result {
            Ok(ack) => {
                self.summary.published += 1;
                debug!(
                    line,
                    topic = %ack.topic,
                    partition = ack.partition,
                    offset = ack.offset,
                    "Line published"
                );
                Ok(PublishOutcome::Published { line, ack })
            }
            Err(error) => match self.config.on_failure {
                FailurePolicy::Skip => {
                    self.summary.skipped += 1;
                    warn!(line, error = %error, "Publish failed after retries, skipping line");
                    Ok(PublishOutcome::Skipped { line, error })
                }
                FailurePolicy::Abort => {
                    self.done = true;
                    error!(line, error = %error, "Publish failed after retries, aborting");
                    self.log_summary();
                    Err(ProducerError::Publish {
                        line,
                        source: error,
                    })
                }
            },
        }
    }

    fn fail_input(&mut self, source: std::io::Error) -> ProducerError {
        self.done = true;
        error!(input = %self.input, error = %source, "Reading input failed");
        ProducerError::Input {
            input: self.input.to_string(),
            source,
        }
    }

    async fn finish(&mut self) {
        self.done = true;
        if let Err(e) = self.producer.flush(self.config.flush_timeout).await {
            warn!(error = %e, "Producer flush failed");
        }
        self.log_summary();
    }

    fn log_summary(&self) {
        info!(
            input = %self.input,
            topic = %self.config.topic,
            published = self.summary.published,
            skipped = self.summary.skipped,
            "Source producer finished"
        );
    }
}

/// Reads lines from an input and publishes each non-blank line as one
/// message, keyed by its 0-based line number.
pub struct SourceProducer {
    producer: Arc<dyn MessageProducer>,
    config: ProducerConfig,
}

impl SourceProducer {
    pub fn new(producer: Arc<dyn MessageProducer>, config: ProducerConfig) -> Self {
        Self { producer, config }
    }

    /// Lazily publish `input`, yielding one outcome per non-blank line in
    /// input order. The stream ends at end of input, or after yielding an
    /// error.
    pub fn run(
        &self,
        input: InputSource,
    ) -> impl Stream<Item = Result<PublishOutcome, ProducerError>> + Send + 'static {
        let state = RunState {
            producer: self.producer.clone(),
            config: self.config.clone(),
            input,
            reader: None,
            line: 0,
            summary: ProducerSummary::default(),
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            state.next().await.map(|item| (item, state))
        })
    }

    /// Drive [`run`](Self::run) to completion.
    pub async fn publish_all(&self, input: InputSource) -> Result<ProducerSummary, ProducerError> {
        let mut summary = ProducerSummary::default();
        let outcomes = self.run(input);
        futures::pin_mut!(outcomes);
        while let Some(outcome) = outcomes.next().await {
            match outcome? {
                PublishOutcome::Published { .. } => summary.published += 1,
                PublishOutcome::Skipped { .. } => summary.skipped += 1,
            }
        }
        Ok(summary)
    }
}
