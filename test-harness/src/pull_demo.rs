// Pull demo: publishes into an in-process stream and drains it through a
// durable pull consumer, one `next` at a time or with `stream`.
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use jetpull_broker::{Broker, InProcessConnection, JetStreamServer, JetStreamServerConfig};
use jetpull_client::{
    ClientConfig, ConsumerError, JetStream, JetStreamMessage, MessageHandler, NextOpt,
    PullConsumer, StreamOpt,
};
use jetpull_transport::Transport;
use jetpull_wire::ConsumerConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const NEXT_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_IDLE_PULLS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Next,
    Stream,
}

#[derive(Parser, Debug)]
#[command(name = "pull-demo")]
#[command(about = "Drives a pull consumer against an in-process broker")]
struct Args {
    /// Stream name
    #[arg(long, default_value = "DEMO")]
    stream: String,

    /// Durable consumer name
    #[arg(long, default_value = "demo-worker")]
    consumer: String,

    /// Delivery mode
    #[arg(long, value_enum, default_value_t = Mode::Stream)]
    mode: Mode,

    /// Total number of messages to publish
    #[arg(long, default_value = "1000")]
    count: u64,

    /// Message payload size in bytes
    #[arg(long, default_value = "128")]
    payload_size: usize,

    /// Messages per second rate (0 = unlimited)
    #[arg(long, default_value = "0")]
    rate: u64,

    /// Pull batch size in stream mode
    #[arg(long, default_value = "100")]
    batch: usize,

    /// Idle heartbeat interval in milliseconds (0 = disabled)
    #[arg(long, default_value = "250")]
    heartbeat_ms: u64,

    /// Client config YAML file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        stream = %args.stream,
        consumer = %args.consumer,
        mode = ?args.mode,
        count = args.count,
        payload_size = args.payload_size,
        rate = args.rate,
        "Starting pull demo"
    );

    let client_config =
        ClientConfig::from_env_or_yaml(args.config.as_deref()).context("load client config")?;
    let broker = Arc::new(Broker::new());
    let server = JetStreamServer::start(
        Arc::clone(&broker),
        JetStreamServerConfig::default().with_api_prefix(client_config.api_prefix.clone()),
    )
    .context("start pull api responder")?;
    server
        .add_stream(&args.stream)
        .await
        .context("add stream")?;

    let transport: Arc<dyn Transport> = Arc::new(InProcessConnection::new(broker));
    let js = JetStream::with_config(transport, client_config);
    let consumer = js
        .ensure_consumer(&args.stream, ConsumerConfig::durable(&args.consumer))
        .await
        .context("ensure consumer")?;
    info!(consumer = %consumer.name(), "Consumer ready");

    let start_time = Instant::now();
    let (published, received) = tokio::try_join!(publish(&server, &args), async {
        match args.mode {
            Mode::Next => consume_next(&consumer, &args).await,
            Mode::Stream => consume_stream(&consumer, &args).await,
        }
    })?;

    let info = consumer.info().await.context("consumer info")?;
    let elapsed = start_time.elapsed();
    info!(
        published = published,
        received = received,
        last_stream_seq = info.delivered.stream,
        pending = info.num_pending,
        elapsed = format!("{:.2}s", elapsed.as_secs_f64()),
        rate = format!("{:.2} msg/s", received as f64 / elapsed.as_secs_f64()),
        "Pull demo completed"
    );
    server.shutdown().await;
    Ok(())
}

async fn publish(server: &JetStreamServer, args: &Args) -> Result<u64> {
    let payload = Bytes::from(vec![b'x'; args.payload_size]);
    let delay = (args.rate > 0).then(|| Duration::from_micros(1_000_000 / args.rate));
    let subject = format!("{}.events", args.stream.to_lowercase());
    let mut published = 0u64;
    while published < args.count {
        server
            .publish(&args.stream, &subject, payload.clone())
            .await
            .context("publish")?;
        published += 1;
        if let Some(delay) = delay {
            sleep(delay).await;
        }
    }
    Ok(published)
}

fn heartbeat(args: &Args) -> Option<Duration> {
    (args.heartbeat_ms > 0).then(|| Duration::from_millis(args.heartbeat_ms))
}

async fn consume_next(consumer: &PullConsumer, args: &Args) -> Result<u64> {
    let opts: Vec<NextOpt> = heartbeat(args).map(NextOpt::Heartbeat).into_iter().collect();
    let mut received = 0u64;
    let mut idle = 0u32;
    while received < args.count {
        match consumer
            .next(Some(NEXT_TIMEOUT), &opts)
            .await
            .context("next")?
        {
            Some(_) => {
                received += 1;
                idle = 0;
                if received % 1000 == 0 {
                    info!(received = received, "Consuming progress");
                }
            }
            None => {
                idle += 1;
                if idle >= MAX_IDLE_PULLS {
                    bail!("no messages after {idle} pulls ({received} received)");
                }
            }
        }
    }
    Ok(received)
}

async fn consume_stream(consumer: &PullConsumer, args: &Args) -> Result<u64> {
    let mut opts = vec![StreamOpt::BatchSize(args.batch)];
    if let Some(interval) = heartbeat(args) {
        opts.push(StreamOpt::Heartbeat(interval));
    }
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: MessageHandler = Box::new(move |delivery: jetpull_client::Result<JetStreamMessage>| {
        let _ = tx.send(delivery);
    });
    let cancel = CancellationToken::new();
    consumer
        .stream(&cancel, Some(handler), &opts)
        .context("start stream")?;

    let mut received = 0u64;
    let outcome = loop {
        if received >= args.count {
            break Ok(received);
        }
        match rx.recv().await {
            Some(Ok(_)) => {
                received += 1;
                if received % 1000 == 0 {
                    info!(received = received, "Consuming progress");
                }
            }
            Some(Err(ConsumerError::NoHeartbeat)) => {
                break Err(anyhow::anyhow!("stream lost heartbeats"));
            }
            Some(Err(err)) => warn!(error = %err, "Stream error"),
            None => break Err(anyhow::anyhow!("stream stopped")),
        }
    };
    cancel.cancel();
    while consumer.is_streaming() {
        sleep(Duration::from_millis(5)).await;
    }
    outcome
}
