//! event-source CLI - run the queue consumer and its supporting tasks
//!
//! `run` consumes from NATS JetStream (or an in-process queue), records each
//! event, hands it to worker tasks and acknowledges it once handled.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use event_source::{
    decode, http, DieselEventStore, EventSource, EventStore, EventStream, JetStreamPublisher,
    JetStreamQueue, MemoryEventStore, MemoryQueue, QueueClient, SourceConfig,
};

#[derive(Parser)]
#[command(name = "event-source")]
#[command(version, about = "Pull-based queue consumer with audited, acknowledged delivery", long_about = None)]
struct Cli {
    /// Path to a YAML config file (environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume events until interrupted
    Run {
        /// Queue transport
        #[arg(long, value_enum, default_value = "nats")]
        queue: QueueKind,

        /// Event record store
        #[arg(long, value_enum, default_value = "sql")]
        store: StoreKind,
    },

    /// Publish a JSON body to the consumed stream
    Publish {
        /// Message body, a JSON object
        #[arg(short, long)]
        body: String,

        /// Message id (random UUID if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Subject to publish to (derived from the consumer filter if omitted)
        #[arg(short, long)]
        subject: Option<String>,
    },

    /// Create the events table if it does not exist
    Migrate,

    /// Load and validate configuration, then print it
    CheckConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum QueueKind {
    Nats,
    Memory,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreKind {
    Sql,
    Memory,
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { queue, store } => run(cli.config, queue, store).await,
        Commands::Publish { body, id, subject } => publish(cli.config, body, id, subject).await,
        Commands::Migrate => migrate(cli.config).await,
        Commands::CheckConfig => check_config(cli.config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> Result<SourceConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => SourceConfig::load_from_file(path)?,
        None => SourceConfig::from_env()?,
    };
    Ok(config)
}

async fn run(
    config_path: Option<PathBuf>,
    queue_kind: QueueKind,
    store_kind: StoreKind,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;

    let queue: Arc<dyn QueueClient> = match queue_kind {
        QueueKind::Nats => Arc::new(JetStreamQueue::connect(&config.nats).await?),
        QueueKind::Memory => {
            tracing::warn!("Using in-process queue; nothing will be received from outside");
            Arc::new(MemoryQueue::new())
        }
    };

    let store: Arc<dyn EventStore> = match store_kind {
        StoreKind::Sql => {
            let database = config.database.clone();
            let store = tokio::task::spawn_blocking(move || {
                let store = DieselEventStore::new(&database)?;
                store.ensure_table()?;
                Ok::<_, event_source::StoreError>(store)
            })
            .await??;
            Arc::new(store)
        }
        StoreKind::Memory => Arc::new(MemoryEventStore::new()),
    };

    let source = EventSource::new(queue, store, config.consumer.clone());
    let stream = source.consume()?;

    let listener = tokio::net::TcpListener::bind(&config.http.addr).await?;
    tracing::info!("Status endpoints listening on {}", config.http.addr);
    let app = http::router(source.clone());
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let workers: Vec<_> = (0..config.consumer.workers)
        .map(|worker| tokio::spawn(run_worker(worker, source.clone(), stream.clone())))
        .collect();
    drop(stream);

    tracing::info!(workers = workers.len(), "Event source running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    if let Err(e) = source.close().await {
        tracing::error!(error = %e, "Event source did not close cleanly");
    }
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Worker task failed");
        }
    }
    server.abort();

    let stats = source.stats();
    tracing::info!(
        emitted = stats.emitted,
        acknowledged = stats.acknowledged,
        decode_failures = stats.decode_failures,
        persist_failures = stats.persist_failures,
        delete_failures = stats.delete_failures,
        "Shutdown complete"
    );
    Ok(())
}

/// Stand-in for downstream business logic: log the event and acknowledge it
async fn run_worker(worker: usize, source: EventSource, stream: EventStream) {
    while let Some(event) = stream.recv().await {
        tracing::info!(
            parent: event.span(),
            worker,
            body = %event.payload.message,
            "Handling event"
        );

        if let Err(e) = source.processed(event).await {
            tracing::warn!(worker, error = %e, "Acknowledgment failed, message will be redelivered");
        }
    }
    tracing::debug!(worker, "Event stream closed, worker exiting");
}

async fn publish(
    config_path: Option<PathBuf>,
    body: String,
    id: Option<String>,
    subject: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;

    // Reject bodies the consumer would only skip
    decode(&body)?;

    let subject = subject.unwrap_or_else(|| default_subject(&config.nats.subject));
    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let publisher = JetStreamPublisher::connect(&config.nats).await?;
    publisher.publish(&subject, &id, &body).await?;

    println!("Published message {} to {}", id, subject);
    Ok(())
}

/// Concrete subject matching a consumer filter such as `events.>`
fn default_subject(filter: &str) -> String {
    let tokens: Vec<&str> = filter
        .split('.')
        .map(|token| if token == ">" || token == "*" { "default" } else { token })
        .collect();
    tokens.join(".")
}

async fn migrate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let database = config.database.clone();

    tokio::task::spawn_blocking(move || {
        let store = DieselEventStore::new(&database)?;
        store.test_connection()?;
        store.ensure_table()?;
        Ok::<_, event_source::StoreError>(store.table().to_string())
    })
    .await?
    .map(|table| println!("Table '{}' is ready", table))?;

    Ok(())
}

fn check_config(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
