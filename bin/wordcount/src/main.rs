//! Word count consumer.
//!
//! Joins a consumer group, counts the words of every line it receives and
//! emits `word<TAB>count` records on every flush. With `--broker memory` the
//! whole pipeline runs in-process: `--input` is published to an in-memory
//! topic first and the counter stops once it has consumed all of it.
//!
//! Exit status: 0 on a clean shutdown, 2 on invalid configuration, 1 on any
//! other failure.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tally_checkpoint::{
    CheckpointStorage, FlushConfig, FsCheckpointStorage, MemoryCheckpointStorage,
};
use tally_connectors::kafka::{KafkaConfig, KafkaConsumer, KafkaProducer};
use tally_connectors::memory::MemoryBroker;
use tally_connectors::{MessageConsumer, MessageProducer, OffsetReset};
use tally_core::{ConfigError, CountingMode};
use tally_runtime::{
    InputSource, ProducerConfig, SnapshotSink, SourceProducer, TopicSink, WordCountConfig,
    WordCounter, WriterSink,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CHECKPOINT_DIR: &str = "tally-checkpoints";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Broker {
    Kafka,
    /// In-process broker, for trying the pipeline without a cluster.
    Memory,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Output {
    Stdout,
    Topic,
}

#[derive(Debug, Parser)]
#[command(name = "wordcount")]
#[command(about = "Count words of lines consumed from a topic")]
struct Args {
    /// Consumer group to join.
    #[arg(long, env = "KAFKA_GROUP_ID", default_value = "tally-wordcount")]
    group: String,

    /// Topic to consume.
    #[arg(long, env = "KAFKA_TOPIC", default_value = "lines")]
    topic: String,

    /// Kafka bootstrap servers.
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    brokers: String,

    /// Seconds between flushes.
    #[arg(long, default_value_t = 10)]
    flush_interval: u64,

    /// Flush early once this many messages were received since the last flush.
    #[arg(long)]
    flush_max_messages: Option<usize>,

    /// `cumulative` keeps all-time totals, `windowed` resets after each flush.
    #[arg(long, default_value = "cumulative")]
    mode: CountingMode,

    #[arg(long, value_enum, default_value = "stdout")]
    output: Output,

    /// Topic counts are republished to with `--output topic`.
    #[arg(long, env = "KAFKA_OUTPUT_TOPIC", default_value = "word-counts")]
    output_topic: String,

    /// Directory for checkpoints. Cumulative mode defaults to
    /// `tally-checkpoints`; windowed mode keeps offsets in the broker only
    /// unless set. Not available with the memory broker.
    #[arg(long, env = "TALLY_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Number of checkpoints to retain.
    #[arg(long, default_value_t = 3)]
    num_retained: usize,

    /// Where the group starts when it has no committed offset.
    #[arg(long, default_value = "earliest")]
    offset_reset: OffsetReset,

    #[arg(long, value_enum, default_value = "kafka")]
    broker: Broker,

    /// Lines to publish before counting, `-` for stdin. Memory broker only.
    #[arg(long)]
    input: Option<String>,
}

impl Args {
    fn counter_config(&self) -> Result<WordCountConfig, ConfigError> {
        let mut flush = FlushConfig::new(Duration::from_secs(self.flush_interval))
            .with_num_retained(self.num_retained);
        if let Some(max) = self.flush_max_messages {
            flush = flush.with_max_buffered_messages(max);
        }
        match (self.broker, &self.checkpoint_dir) {
            (Broker::Memory, Some(_)) => {
                return Err(ConfigError::invalid(
                    "checkpoint-dir",
                    "the memory broker starts empty on every run, checkpoints would not match it",
                ));
            }
            (Broker::Kafka, Some(dir)) => flush = flush.with_checkpoint_dir(dir),
            (Broker::Kafka, None) if self.mode == CountingMode::Cumulative => {
                flush = flush.with_checkpoint_dir(DEFAULT_CHECKPOINT_DIR);
            }
            _ => {}
        }

        let config = WordCountConfig::new(self.group.clone(), self.topic.clone())
            .with_mode(self.mode)
            .with_flush(flush);
        config.validate()?;

        if self.input.is_some() && matches!(self.broker, Broker::Kafka) {
            return Err(ConfigError::invalid(
                "input",
                "only supported with `--broker memory`, use source-client for Kafka",
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("wordcount").chain(args.iter().copied()))
    }

    #[test]
    fn test_cumulative_kafka_defaults_checkpoint_dir() {
        let config = parse(&[]).counter_config().unwrap();
        assert_eq!(
            config.flush.checkpoint_dir,
            Some(PathBuf::from(DEFAULT_CHECKPOINT_DIR))
        );

        let config = parse(&["--checkpoint-dir", "/tmp/counts"]).counter_config().unwrap();
        assert_eq!(config.flush.checkpoint_dir, Some(PathBuf::from("/tmp/counts")));
    }

    #[test]
    fn test_windowed_kafka_has_no_default_checkpoint_dir() {
        let config = parse(&["--mode", "windowed"]).counter_config().unwrap();
        assert_eq!(config.flush.checkpoint_dir, None);
    }

    #[test]
    fn test_memory_broker_rejects_checkpoint_dir() {
        let err = parse(&["--broker", "memory", "--input", "lines.txt", "--checkpoint-dir", "d"])
            .counter_config()
            .unwrap_err();
        assert!(err.to_string().contains("checkpoint-dir"), "{err}");

        let config = parse(&["--broker", "memory"]).counter_config().unwrap();
        assert_eq!(config.flush.checkpoint_dir, None);
    }

    #[test]
    fn test_input_requires_memory_broker() {
        assert!(parse(&["--input", "lines.txt"]).counter_config().is_err());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Records go to stdout, logs to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            error!(error = %format!("{e:#}"), "Invalid configuration");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Word counter failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args.counter_config()?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, flushing and shutting down");
                shutdown.cancel();
            }
        }
    });

    match args.broker {
        Broker::Kafka => {
            let storage: Option<Arc<dyn CheckpointStorage>> = match &config.flush.checkpoint_dir {
                Some(dir) => Some(Arc::new(FsCheckpointStorage::new(dir).with_context(|| {
                    format!("opening checkpoint directory {}", dir.display())
                })?)),
                None => None,
            };

            let consumer = KafkaConsumer::connect(
                KafkaConfig::new(args.brokers.clone())
                    .with_group_id(args.group.clone())
                    .with_topics(config.topics.clone())
                    .with_offset_reset(args.offset_reset)
                    .with_client_id("tally-wordcount"),
            )
            .await
            .with_context(|| format!("connecting to {}", args.brokers))?;

            let sink: Arc<dyn SnapshotSink> = match args.output {
                Output::Stdout => Arc::new(WriterSink::stdout()),
                Output::Topic => {
                    let producer = KafkaProducer::connect(
                        KafkaConfig::new(args.brokers.clone()).with_client_id("tally-wordcount"),
                    )
                    .await
                    .with_context(|| format!("connecting to {}", args.brokers))?;
                    Arc::new(TopicSink::new(Arc::new(producer), args.output_topic.clone()))
                }
            };

            let counter = counter(config, Arc::new(consumer), sink, storage);
            counter.run(shutdown).await
        }
        Broker::Memory => run_in_memory(&args, config, shutdown).await,
    }
}

fn counter(
    config: WordCountConfig,
    consumer: Arc<dyn MessageConsumer>,
    sink: Arc<dyn SnapshotSink>,
    storage: Option<Arc<dyn CheckpointStorage>>,
) -> WordCounter {
    let counter = WordCounter::new(config, consumer, sink);
    match storage {
        Some(storage) => counter.with_checkpoint_storage(storage),
        None => counter,
    }
}

async fn run_in_memory(
    args: &Args,
    config: WordCountConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let broker = MemoryBroker::new(1);

    let published = match &args.input {
        Some(input) => {
            let producer: Arc<dyn MessageProducer> = Arc::new(broker.producer());
            let summary = SourceProducer::new(producer, ProducerConfig::new(args.topic.clone()))
                .publish_all(InputSource::from_arg(input))
                .await
                .context("publishing input")?;
            info!(published = summary.published, "Input published to the in-memory topic");
            Some(summary.published)
        }
        None => None,
    };

    let sink: Arc<dyn SnapshotSink> = match args.output {
        Output::Stdout => Arc::new(WriterSink::stdout()),
        Output::Topic => Arc::new(TopicSink::new(
            Arc::new(broker.producer()),
            args.output_topic.clone(),
        )),
    };

    let counter = Arc::new(counter(
        config,
        Arc::new(broker.consumer(args.group.clone(), args.offset_reset)),
        sink,
        // Lives and dies with the broker.
        Some(Arc::new(MemoryCheckpointStorage::new())),
    ));

    // Stop once everything that was published has been consumed.
    if let Some(published) = published {
        let counter = counter.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            while counter.stats().messages < published {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
            shutdown.cancel();
        });
    }

    counter.run(shutdown).await
}
