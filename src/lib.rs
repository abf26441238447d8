#![warn(missing_docs)]
//! Core library entry points for the rowstream change-capture pipeline.
//!
//! Changed product rows flow from the relational store onto a durable queue
//! (backfill scan first, live notifications after), and a consumer drains
//! the queue into embedding vectors upserted to a vector search index.

pub mod embedder;
pub mod envelope;
mod fingerprint;
pub mod index;
pub mod listener;
pub mod metadata;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod scanner;
pub mod store;

pub use envelope::{parse_message_body, ChangeEnvelope, EmbedderInput, EnvelopeError, TEXT_FIELD};
pub use index::{batch_by_size, QueryMatch, VectorIndex, VectorRecord, MAX_UPSERT_BYTES};
pub use listener::{listen_once, ListenExit, RECONNECT_DELAY};
pub use metadata::{MetadataMap, MetadataValue};
pub use orchestrator::{ConsumerConfig, CycleSummary, Orchestrator};
pub use pool::{embed_texts, EmbedMode};
pub use queue::{ChangeQueue, QueueConfig, QueueMessage, ReceiptHandle, RecoverySummary};
pub use retry::Backoff;
pub use scanner::{run_backfill, BackfillSummary, DEFAULT_BATCH_SIZE};
pub use store::{bootstrap_complete, ProductRow, TableName, CHANGE_CHANNEL};
