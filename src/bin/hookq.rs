//! hookq CLI: run the dispatcher service or operate on queues.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use hookq::config::secrets::{ExposeSecret, redact_database_url};
use hookq::config::{Config, StoreBackend};
use hookq::db::{Db, DbOptions};
use hookq::dispatch::HttpDispatcher;
use hookq::engine::{Supervisor, SupervisorConfig};
use hookq::model::{EnqueueResult, NewWorkItem, QueueRef};
use hookq::store::{MemoryStore, SharedStore};
use hookq::telemetry::{TelemetryConfig, init_telemetry};
use tracing::info;

#[derive(Parser)]
#[command(name = "hookq", about = "Durable HTTP-dispatching work queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the consumer and cron loops until interrupted
    Serve,
    /// Enqueue a work item
    Enqueue {
        /// URL to GET, absolute or relative to BASE_URL
        url: String,
        /// Queue key (a fresh key when omitted)
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        debug_info: Option<String>,
        /// Skip if an unattempted item with the same queue and URL exists
        #[arg(long)]
        dedup: bool,
        /// Queue kept blocked until this item completes
        #[arg(long)]
        blocks: Option<String>,
        /// External lock taken on the queue once this item completes
        #[arg(long)]
        lock_when_complete: Option<String>,
    },
    /// Pause a queue (reserving it if unused)
    Pause { queue: String },
    /// Resume a paused queue
    Resume { queue: String },
    /// Clear a queue's error count and backoff
    Reset { queue: String },
    /// Take an external lock on a queue
    Lock { queue: String, lock_id: String },
    /// Release an external lock
    Unlock { queue: String, lock_id: String },
    /// Purge expired completed items on every shard
    Purge,
    /// Report queue health
    Health {
        #[arg(long)]
        json: bool,
    },
    /// Show a queue's state and pending items
    Queue { queue: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        command => {
            if config.store_backend == StoreBackend::Memory {
                anyhow::bail!("the memory backend only supports `serve`");
            }
            let store = open_store(&config).await?;
            run_command(&store, command).await
        }
    }
}

async fn open_store(config: &Config) -> anyhow::Result<SharedStore> {
    let sharding = config.sharding()?;
    match config.store_backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new(sharding))),
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
            info!(database = %redact_database_url(url), "connecting");
            let db = Db::connect(
                url.expose_secret(),
                DbOptions {
                    sharding,
                    single_connection: config.single_db_connection,
                    ..DbOptions::default()
                },
            )
            .await?;
            db.migrate().await?;
            Ok(Arc::new(db))
        }
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "hookq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let cron_jobs = config.cron_jobs()?;
    let store = open_store(&config).await?;
    let dispatcher = Arc::new(HttpDispatcher::new(config.dispatch_config())?);

    let supervisor = Supervisor::new(
        store,
        dispatcher,
        SupervisorConfig {
            poll_interval: config.poll_interval,
            cron_jobs,
            ..SupervisorConfig::default()
        },
    );
    supervisor.start();

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    supervisor.shutdown().await;
    Ok(())
}

async fn run_command(store: &SharedStore, command: Command) -> anyhow::Result<()> {
    let sharding = store.sharding();
    match command {
        Command::Serve => anyhow::bail!("serve is not a queue operation"),
        Command::Enqueue {
            url,
            queue,
            debug_info,
            dedup,
            blocks,
            lock_when_complete,
        } => {
            let mut item = NewWorkItem::new(url).duplicate_protection(dedup);
            if let Some(queue) = queue {
                item = item.queue(queue);
            }
            if let Some(info) = debug_info {
                item = item.debug_info(info);
            }
            if let Some(target) = blocks {
                item = item.blocks(target);
            }
            if let Some(lock_id) = lock_when_complete {
                item = item.lock_when_complete(lock_id);
            }
            match store.enqueue(item).await? {
                EnqueueResult::Created { id, queue } => println!("Created: {id} in {queue}"),
                EnqueueResult::Duplicate { existing, queue } => {
                    println!("Duplicate of {existing} in {queue}")
                }
            }
        }
        Command::Pause { queue } => {
            store.pause_queue(&QueueRef::new(queue, &sharding)).await?;
            println!("Paused");
        }
        Command::Resume { queue } => {
            store.resume_queue(&QueueRef::new(queue, &sharding)).await?;
            println!("Resumed");
        }
        Command::Reset { queue } => {
            store.reset_queue(&QueueRef::new(queue, &sharding)).await?;
            println!("Reset");
        }
        Command::Lock { queue, lock_id } => {
            store
                .acquire_external_lock(&QueueRef::new(queue, &sharding), &lock_id)
                .await?;
            println!("Locked");
        }
        Command::Unlock { queue, lock_id } => {
            store
                .release_external_lock(&QueueRef::new(queue, &sharding), &lock_id)
                .await?;
            println!("Unlocked");
        }
        Command::Purge => {
            let mut total = 0;
            for shard in sharding.shards() {
                total += store.purge_work_items(shard).await?;
            }
            println!("Purged {total} completed item(s)");
        }
        Command::Health { json } => {
            let health = store.queue_health_check().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else if health.healthy {
                println!("healthy");
            } else {
                println!(
                    "unhealthy: {} queue(s) at the error threshold",
                    health.unhealthy_queues
                );
            }
            if !health.healthy {
                std::process::exit(1);
            }
        }
        Command::Queue { queue } => {
            let queue = QueueRef::new(queue, &sharding);
            match store.queue_state(&queue).await? {
                None => println!("Queue {queue} has no row"),
                Some(state) => {
                    println!("Queue:      {queue}");
                    println!("Head:       {}", state.next_work_item_id);
                    println!("Errors:     {}", state.error_count);
                    println!("Locked:     {}", state.locked_until);
                    println!("Paused:     {}", state.is_paused);
                    println!(
                        "Lock:       {}",
                        state.external_lock_id.as_deref().unwrap_or("-")
                    );
                    println!("Blocked by: {}", state.blocked_by.len());
                }
            }
            let pending = store.pending_work_items(&queue).await?;
            println!("---");
            for item in &pending {
                let url = if item.is_noop() { "<placeholder>" } else { item.url.as_str() };
                println!(
                    "{:<10}  {:<24}  {}",
                    item.id,
                    item.created_at.format("%Y-%m-%d %H:%M:%S"),
                    url
                );
            }
            println!("{} pending item(s)", pending.len());
        }
    }
    Ok(())
}
