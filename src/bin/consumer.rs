use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use rowstream::embedder::{Embedder, HashEmbedder, OpenAiEmbedder};
use rowstream::index::VectorIndex;
use rowstream::orchestrator::{ConsumerConfig, Orchestrator};
use rowstream::pool::EmbedMode;
use rowstream::queue::{ChangeQueue, QueueConfig};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "rowstream-consumer",
    about = "Drain change envelopes from the queue into embedded vectors upserted to the index"
)]
struct ConsumerCli {
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

    /// Seconds a received message stays invisible before redelivery
    #[arg(long, env = "ROWSTREAM_VISIBILITY_SECS", default_value_t = 30)]
    visibility_secs: u64,

    /// Deliveries allowed before a message is dead-lettered
    #[arg(long, env = "ROWSTREAM_MAX_RECEIVES", default_value_t = 4)]
    max_receive_count: u32,

    /// Seconds the first receive of each cycle long-polls for
    #[arg(long, env = "ROWSTREAM_RECEIVE_WAIT_SECS", default_value_t = 5)]
    receive_wait_secs: u64,

    /// Most messages pulled per poll cycle
    #[arg(long, env = "ROWSTREAM_MAX_MESSAGES", default_value_t = 10)]
    max_messages: usize,

    /// Milliseconds to idle after an empty poll
    #[arg(long, env = "ROWSTREAM_IDLE_MS", default_value_t = 1000)]
    idle_ms: u64,

    /// Milliseconds at the base of the receive-failure backoff
    #[arg(long, env = "ROWSTREAM_BACKOFF_BASE_MS", default_value_t = 1000)]
    backoff_base_ms: u64,

    /// Embedding backend
    #[arg(long, env = "ROWSTREAM_EMBEDDER", value_enum, default_value = "openai")]
    embedder: EmbedderBackend,

    /// API key for the embedding endpoint (openai backend only)
    #[arg(long, env = "OPENAI_API_KEY", default_value = "")]
    openai_api_key: String,

    /// Embedding model identifier
    #[arg(
        long,
        env = "ROWSTREAM_OPENAI_MODEL",
        default_value = "text-embedding-3-small"
    )]
    openai_model: String,

    /// Embedding dimension requested from the backend
    #[arg(long, env = "ROWSTREAM_EMBED_DIM", default_value_t = 384)]
    embed_dim: usize,

    /// Base URL for the OpenAI-compatible API
    #[arg(
        long,
        env = "ROWSTREAM_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    openai_base_url: String,

    /// Seconds before embedding requests time out
    #[arg(long, env = "ROWSTREAM_OPENAI_TIMEOUT_SECS", default_value_t = 30)]
    openai_timeout_secs: u64,

    /// Retry attempts for transient embedding errors
    #[arg(long, env = "ROWSTREAM_OPENAI_MAX_RETRIES", default_value_t = 5)]
    openai_max_retries: usize,

    /// Vector index data-plane host
    #[arg(long, env = "ROWSTREAM_INDEX_HOST")]
    index_host: String,

    /// Vector index API key
    #[arg(long, env = "ROWSTREAM_INDEX_API_KEY")]
    index_api_key: String,

    /// Namespace shared with the producer side
    #[arg(long, env = "ROWSTREAM_INDEX_NAMESPACE", default_value = "")]
    index_namespace: String,

    /// Seconds before index requests time out
    #[arg(long, env = "ROWSTREAM_INDEX_TIMEOUT_SECS", default_value_t = 30)]
    index_timeout_secs: u64,

    /// Retry attempts for transient index errors
    #[arg(long, env = "ROWSTREAM_INDEX_MAX_RETRIES", default_value_t = 5)]
    index_max_retries: usize,

    /// Embedding scheduling mode within a poll cycle
    #[arg(long, env = "ROWSTREAM_EMBED_MODE", value_enum, default_value = "serial")]
    embed_mode: EmbedMode,

    /// Worker count for pooled embedding (0 = number of CPUs)
    #[arg(long, env = "ROWSTREAM_EMBED_WORKERS", default_value_t = 0)]
    embed_workers: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum EmbedderBackend {
    /// OpenAI-compatible HTTP embeddings endpoint.
    Openai,
    /// Deterministic feature-hash embedder; no endpoint required.
    Hash,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = ConsumerCli::parse();

    let queue = ChangeQueue::connect(
        &cli.queue_url,
        QueueConfig {
            queue_key: cli.queue_key.clone(),
            dead_letter_key: cli.dead_letter_key.clone(),
            visibility_timeout: Duration::from_secs(cli.visibility_secs.max(1)),
            max_receive_count: cli.max_receive_count.max(1),
            receive_wait: Duration::from_secs(cli.receive_wait_secs),
        },
    )?;

    let max_messages = cli.max_messages.max(1);
    let embedder: Arc<dyn Embedder> = match cli.embedder {
        EmbedderBackend::Openai => Arc::new(OpenAiEmbedder::new(
            cli.openai_api_key.clone(),
            cli.openai_base_url.clone(),
            cli.openai_model.clone(),
            Some(cli.embed_dim),
            Duration::from_secs(cli.openai_timeout_secs.max(1)),
            cli.openai_max_retries.max(1),
            max_messages,
        )?),
        EmbedderBackend::Hash => Arc::new(HashEmbedder::new(cli.embed_dim)),
    };

    let index = VectorIndex::new(
        cli.index_host.clone(),
        cli.index_api_key.clone(),
        cli.index_namespace.clone(),
        Duration::from_secs(cli.index_timeout_secs.max(1)),
        cli.index_max_retries.max(1),
    )?;

    let embed_workers = if cli.embed_workers == 0 {
        num_cpus::get()
    } else {
        cli.embed_workers
    };
    let config = ConsumerConfig {
        max_messages,
        idle_delay: Duration::from_millis(cli.idle_ms),
        backoff_base: Duration::from_millis(cli.backoff_base_ms.max(1)),
        embed_mode: cli.embed_mode,
        embed_workers,
    };
    let orchestrator = Orchestrator::new(queue, index, embedder, config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("termination signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    orchestrator.run(shutdown_rx).await
}
