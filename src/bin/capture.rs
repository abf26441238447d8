use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rowstream::listener::{listen_once, ListenExit};
use rowstream::queue::{ChangeQueue, QueueConfig};
use rowstream::scanner::run_backfill;
use rowstream::store::{self, TableName};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "rowstream-capture",
    about = "Backfill unprocessed product rows, then bridge live change notifications onto the queue"
)]
struct CaptureCli {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Redis connection string backing the durable queue (redis://...)
    #[arg(long, env = "ROWSTREAM_QUEUE_URL")]
    queue_url: String,

    /// List key holding pending change messages
    #[arg(long, env = "ROWSTREAM_QUEUE_KEY", default_value = "rowstream:changes")]
    queue_key: String,

    /// List key receiving dead-lettered messages
    #[arg(
        long,
        env = "ROWSTREAM_DLQ_KEY",
        default_value = "rowstream:changes:dead"
    )]
    dead_letter_key: String,

    /// Target schema for the product table
    #[arg(long, env = "ROWSTREAM_SCHEMA", default_value = "public")]
    schema: String,

    /// Product table name inside the schema
    #[arg(
        long,
        env = "ROWSTREAM_TABLE",
        default_value = "products_with_increment"
    )]
    table: String,

    /// Notification channel emitted by the change trigger
    #[arg(long, env = "ROWSTREAM_CHANNEL", default_value = "table_change")]
    channel: String,

    /// Rows claimed per backfill transaction
    #[arg(long, env = "ROWSTREAM_BATCH_SIZE", default_value_t = 1000)]
    batch_size: usize,

    /// Seconds to wait before reconnecting a dropped listen connection
    #[arg(long, env = "ROWSTREAM_RECONNECT_SECS", default_value_t = 5)]
    reconnect_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = CaptureCli::parse();
    let table = TableName::new(cli.schema.clone(), cli.table.clone())?;
    let queue = ChangeQueue::connect(
        &cli.queue_url,
        QueueConfig {
            queue_key: cli.queue_key.clone(),
            dead_letter_key: cli.dead_letter_key.clone(),
            ..QueueConfig::default()
        },
    )?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("termination signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let reconnect_delay = Duration::from_secs(cli.reconnect_secs.max(1));
    while !*shutdown_rx.borrow() {
        match capture_pass(&cli, &table, &queue, &mut shutdown_rx).await {
            Ok(ListenExit::Shutdown) => break,
            Ok(ListenExit::ConnectionLost) => {
                info!(
                    delay_secs = reconnect_delay.as_secs(),
                    "reconnecting after connection loss"
                );
            }
            Err(err) => {
                error!("capture pass failed: {err:#}");
            }
        }
        sleep_or_shutdown(reconnect_delay, &mut shutdown_rx).await;
    }
    info!("capture process exiting");
    Ok(())
}

/// One backfill-then-listen pass over a fresh store connection.
///
/// Re-checks backfill completion each time: a long outage can leave rows
/// unprocessed, and listening must not resume ahead of re-scanning them.
async fn capture_pass(
    cli: &CaptureCli,
    table: &TableName,
    queue: &ChangeQueue,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ListenExit> {
    let mut client = store::connect(&cli.database_url).await?;
    if !store::bootstrap_complete(&client).await? {
        let summary = run_backfill(&mut client, queue, table, cli.batch_size).await?;
        info!(rows = summary.rows_published, "backfill pass finished");
    }
    drop(client);
    listen_once(&cli.database_url, &cli.channel, queue, shutdown).await
}

async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => {}
    }
}
