//! Publishes every non-empty line of a file (or stdin) to a topic.
//!
//! Exit status: 0 when the input was published, 2 on invalid configuration,
//! 1 on any other failure.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use std::process::ExitCode;
use std::sync::Arc;
use tally_connectors::kafka::{KafkaConfig, KafkaProducer};
use tally_connectors::memory::MemoryBroker;
use tally_connectors::MessageProducer;
use tally_core::ConfigError;
use tally_runtime::{
    FailurePolicy, InputSource, ProducerConfig, ProducerSummary, PublishOutcome, SourceProducer,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Broker {
    Kafka,
    /// In-process broker, for trying the client without a cluster.
    Memory,
}

#[derive(Debug, Parser)]
#[command(name = "source-client")]
#[command(about = "Publish lines of text to a topic, one message per line")]
struct Args {
    /// Input file, or `-` for stdin.
    #[arg(long)]
    input: String,

    /// Topic to publish to.
    #[arg(long, env = "KAFKA_TOPIC", default_value = "lines")]
    topic: String,

    /// Kafka bootstrap servers.
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    brokers: String,

    /// Retries per line after the first attempt.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// What to do with a line that still fails after all retries.
    #[arg(long, default_value = "abort")]
    on_failure: FailurePolicy,

    #[arg(long, value_enum, default_value = "kafka")]
    broker: Broker,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(summary) => {
            info!(
                published = summary.published,
                skipped = summary.skipped,
                "Source client finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            error!(error = %format!("{e:#}"), "Invalid configuration");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Source client failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ProducerSummary> {
    let config = ProducerConfig::new(args.topic.clone())
        .with_max_retries(args.max_retries)
        .with_failure_policy(args.on_failure);
    config.validate()?;

    let producer: Arc<dyn MessageProducer> = match args.broker {
        Broker::Kafka => {
            let kafka = KafkaConfig::new(args.brokers.clone()).with_client_id("tally-source-client");
            let producer = KafkaProducer::connect(kafka)
                .await
                .with_context(|| format!("connecting to {}", args.brokers))?;
            Arc::new(producer)
        }
        Broker::Memory => {
            warn!("Publishing to an in-process broker, messages are discarded on exit");
            Arc::new(MemoryBroker::new(1).producer())
        }
    };

    let input = InputSource::from_arg(&args.input);
    info!(input = %input, topic = %args.topic, on_failure = %args.on_failure, "Publishing");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping after the current line");
                shutdown.cancel();
            }
        }
    });

    let source = SourceProducer::new(producer, config);
    let outcomes = source.run(input);
    futures::pin_mut!(outcomes);

    let mut summary = ProducerSummary::default();
    loop {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = outcomes.next() => outcome,
        };
        match outcome {
            Some(Ok(PublishOutcome::Published { line, ack })) => {
                debug!(line, partition = ack.partition, offset = ack.offset, "Line published");
                summary.published += 1;
            }
            Some(Ok(PublishOutcome::Skipped { .. })) => summary.skipped += 1,
            Some(Err(e)) => return Err(e).context("publishing input"),
            None => break,
        }
    }
    Ok(summary)
}
