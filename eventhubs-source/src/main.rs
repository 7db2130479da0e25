use std::future::ready;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use envconfig::Envconfig;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use eventhubs_source::config::Config;
use eventhubs_source::metrics::{serve, setup_metrics_routes};
use eventhubs_source::offsets::{EmptyOffsetReader, FileOffsetReader, OffsetStorageReader};
use eventhubs_source::task::EventHubsSourceTask;
use eventhubs_source::types::SourceRecord;

pub async fn index() -> &'static str {
    "eventhubs source"
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));
    let router = setup_metrics_routes(router).context("Failed to install metrics recorder")?;

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = ?e, "Failed to serve metrics on {}", bind);
        }
    }))
}

/// One stdout line per output record; payloads are base64 encoded.
#[derive(Serialize)]
struct OutputLine<'a> {
    topic: &'a str,
    source_topic: &'a str,
    source_partition: i32,
    source_offset: i64,
    key: Option<String>,
    value: Option<String>,
    timestamp: Option<i64>,
}

impl<'a> From<&'a SourceRecord> for OutputLine<'a> {
    fn from(record: &'a SourceRecord) -> Self {
        Self {
            topic: &record.topic,
            source_topic: record.source_partition.topic(),
            source_partition: record.source_partition.partition(),
            source_offset: record.source_offset.value(),
            key: record.key.as_deref().map(|key| STANDARD.encode(key)),
            value: record.value.as_deref().map(|value| STANDARD.encode(value)),
            timestamp: record.timestamp,
        }
    }
}

fn write_records(out: &mut impl Write, records: &[SourceRecord]) -> Result<()> {
    for record in records {
        serde_json::to_writer(&mut *out, &OutputLine::from(record))?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Drives the source task on a blocking thread until shutdown or a fatal error.
fn run_pump(
    config: Config,
    offsets: Arc<dyn OffsetStorageReader>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut task: EventHubsSourceTask = EventHubsSourceTask::new();
    task.start(&config, offsets)
        .context("Failed to start source task. Check the EventHubs connection settings.")?;
    info!(version = task.version(), "Source task running");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut pumped = Ok(());
    while !shutdown.is_cancelled() {
        let records = match task.poll() {
            Ok(Some(records)) => records,
            Ok(None) => continue,
            Err(e) => {
                pumped = Err(anyhow::Error::new(e).context("Source task failed"));
                break;
            }
        };
        if let Err(e) = write_records(&mut out, &records) {
            pumped = Err(e.context("Failed to write records to stdout"));
            break;
        }
    }

    let stopped = task.stop().context("Failed to stop source task");
    pumped?;
    stopped
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    info!("Starting EventHubs source");

    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    info!("Configuration loaded: {:?}", config);

    let offsets: Arc<dyn OffsetStorageReader> = match &config.offset_store_path {
        Some(path) => {
            info!("Reading committed offsets from {}", path);
            Arc::new(FileOffsetReader::new(path, config.connector_name.clone()))
        }
        None => Arc::new(EmptyOffsetReader),
    };

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal_token.cancel();
            }
            Err(e) => error!(error = ?e, "Failed to listen for shutdown signal"),
        }
    });

    // The task API is blocking, keep it off the async workers
    let result = tokio::task::spawn_blocking(move || run_pump(config, offsets, shutdown))
        .await
        .context("Source task thread panicked")?;

    server_handle.abort();

    result
}
