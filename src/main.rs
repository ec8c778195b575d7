//! `resilient-client` command line.
//!
//! Sends requests through the full pipeline and manages the durable offline
//! queue. `run` keeps a worker alive that drains the queue on an interval
//! and hot-reloads the configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use resilient_client::config::load_config;
use resilient_client::connectivity::Connectivity;
use resilient_client::interceptor::{BearerAuth, RequestIdHeader};
use resilient_client::observability::{logging, metrics};
use resilient_client::{
    Client, ClientConfig, ExecuteOutcome, Method, Priority, RequestDescriptor, Shutdown,
};

#[derive(Parser)]
#[command(name = "resilient-client")]
#[command(about = "Resilient outbound client with a durable offline queue", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Queue directory; overrides `queue.store_path`.
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Start with connectivity reported as down.
    #[arg(long)]
    offline: bool,

    /// Bearer credential attached to every request.
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one request
    Send {
        service: String,
        path: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: Method,
        /// JSON body
        #[arg(short, long)]
        data: Option<String>,
        /// Extra header as name=value (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long)]
        idempotency_key: Option<String>,
        /// Fail instead of queueing when the service is unreachable
        #[arg(long)]
        fail_fast: bool,
    },
    /// Inspect and manage the offline queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Drain the queue periodically until interrupted
    Run,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Pending, in-flight and failed counts
    Stats,
    /// Every entry in replay order
    List,
    /// Replay due entries now
    Drain,
    /// Requeue a dead letter with a fresh retry budget
    Retry { id: Uuid },
    /// Delete a dead letter
    Discard { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ClientConfig::default(),
    };
    if let Some(store) = &cli.store {
        config.queue.store_path = Some(store.to_string_lossy().into_owned());
    }
    if config.queue.store_path.is_none() {
        config.queue.store_path = Some(".resilient-client/queue".to_string());
    }
    logging::init(&config.observability.log_level);

    let mut builder = Client::builder(config.clone())
        .connectivity(Connectivity::new(!cli.offline))
        .interceptor(Arc::new(RequestIdHeader));
    if let Some(token) = &cli.token {
        builder = builder.interceptor(Arc::new(BearerAuth::new(token.clone())));
    }
    let client = builder.build().await?;

    match cli.command {
        Commands::Send {
            service,
            path,
            method,
            data,
            headers,
            priority,
            idempotency_key,
            fail_fast,
        } => {
            let mut request = RequestDescriptor::new(service, method, path).with_priority(priority);
            if let Some(data) = data {
                let body: Value = serde_json::from_str(&data)?;
                request = request.with_body(body);
            }
            for header in headers {
                let Some((name, value)) = header.split_once('=') else {
                    return Err(format!("header '{}' is not name=value", header).into());
                };
                request = request.with_header(name.trim(), value.trim());
            }
            if let Some(key) = idempotency_key {
                request = request.with_idempotency_key(key);
            }
            if fail_fast {
                request = request.fail_fast();
            }

            match client.execute(request).await? {
                ExecuteOutcome::Completed(response) => {
                    eprintln!("HTTP {}", response.status);
                    match response.json::<Value>() {
                        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                        Err(_) => println!("{}", response.text()),
                    }
                }
                ExecuteOutcome::Queued { entry_id } => {
                    println!("queued {}", entry_id);
                }
            }
        }
        Commands::Queue { command } => match command {
            QueueCommands::Stats => {
                println!("{}", serde_json::to_string_pretty(&client.get_queue_stats())?);
            }
            QueueCommands::List => {
                for entry in client.queue_entries() {
                    println!(
                        "{}  {:<9} {:<6} attempts={} {} {} {}{}",
                        entry.id(),
                        format!("{:?}", entry.status),
                        format!("{:?}", entry.request.priority),
                        entry.attempts,
                        entry.request.service_name,
                        entry.request.method,
                        entry.request.path,
                        entry
                            .last_error
                            .as_deref()
                            .map(|e| format!("  ({})", e))
                            .unwrap_or_default(),
                    );
                }
            }
            QueueCommands::Drain => {
                let report = client.process_queue().await?;
                println!(
                    "replayed={} rescheduled={} dead_lettered={} deferred={}",
                    report.replayed.len(),
                    report.rescheduled.len(),
                    report.dead_lettered.len(),
                    report.deferred
                );
            }
            QueueCommands::Retry { id } => {
                if !client.retry_dead_letter(&id).await? {
                    return Err(format!("{} is not a dead letter", id).into());
                }
                println!("requeued {}", id);
            }
            QueueCommands::Discard { id } => {
                if client.discard_dead_letter(&id).await?.is_none() {
                    return Err(format!("{} is not a dead letter", id).into());
                }
                println!("discarded {}", id);
            }
        },
        Commands::Run => {
            if config.observability.metrics_enabled {
                match config.observability.metrics_address.parse() {
                    Ok(addr) => metrics::init_metrics(addr)?,
                    Err(_) => tracing::error!(
                        metrics_address = %config.observability.metrics_address,
                        "Failed to parse metrics address"
                    ),
                }
            }

            let shutdown = Shutdown::new();
            let mut workers = vec![client.spawn_background(shutdown.subscribe())];
            if let Some(path) = &cli.config {
                workers.push(client.watch_config(path, shutdown.subscribe())?);
            }

            tracing::info!(queued = client.get_queue_stats().pending, "Worker running");
            shutdown.trigger_on_signal().await;
            for worker in workers {
                worker.await?;
            }
            tracing::info!("Shutdown complete");
        }
    }

    Ok(())
}
