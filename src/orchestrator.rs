//! The consumer loop: receive, embed, upsert, then acknowledge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::embedder::Embedder;
use crate::envelope::{parse_message_body, EmbedderInput, EnvelopeError};
use crate::index::{batch_by_size, VectorIndex, VectorRecord, MAX_UPSERT_BYTES};
use crate::pool::{embed_texts, EmbedMode};
use crate::queue::{ChangeQueue, QueueMessage};
use crate::retry::Backoff;

/// Tunable knobs for the consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Most messages pulled per poll cycle.
    pub max_messages: usize,
    /// Pause after an empty poll before polling again.
    pub idle_delay: Duration,
    /// Base delay for receive-failure backoff.
    pub backoff_base: Duration,
    /// Embedding scheduling mode.
    pub embed_mode: EmbedMode,
    /// Worker count for the pooled embedding path.
    pub embed_workers: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            idle_delay: Duration::from_secs(1),
            backoff_base: Duration::from_secs(1),
            embed_mode: EmbedMode::Serial,
            embed_workers: num_cpus::get(),
        }
    }
}

/// Totals for one completed poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Messages embedded, upserted, and acknowledged.
    pub processed: usize,
    /// Messages skipped as malformed, left in place for redelivery.
    pub skipped: usize,
    /// Upsert batches flushed to the index.
    pub batches: usize,
}

/// Long-running orchestrator converting queued envelopes into upserts.
pub struct Orchestrator {
    queue: ChangeQueue,
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    config: ConsumerConfig,
}

impl Orchestrator {
    /// Builds an orchestrator from its long-lived collaborators.
    pub fn new(
        queue: ChangeQueue,
        index: VectorIndex,
        embedder: Arc<dyn Embedder>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            index,
            embedder,
            config,
        }
    }

    /// Supervised poll loop; runs until the shutdown flag flips.
    ///
    /// Receive transport errors back off exponentially and never kill the
    /// loop; a failed cycle leaves its messages unacknowledged so the queue
    /// redelivers them after the visibility timeout.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            max_messages = self.config.max_messages,
            namespace = self.index.namespace(),
            "consumer loop starting"
        );
        let mut backoff = Backoff::new(self.config.backoff_base);
        while !*shutdown.borrow() {
            if let Err(err) = self.queue.recover_expired().await {
                warn!("expiry sweep failed: {err:#}");
            }

            let messages = match self.queue.receive(self.config.max_messages).await {
                Ok(messages) => {
                    backoff.reset();
                    messages
                }
                Err(err) => {
                    let delay = backoff.record_failure();
                    warn!(
                        retry_in_ms = delay.as_millis() as u64,
                        "queue receive failed: {err:#}"
                    );
                    sleep_until_shutdown(delay, &mut shutdown).await;
                    continue;
                }
            };

            if messages.is_empty() {
                sleep_until_shutdown(self.config.idle_delay, &mut shutdown).await;
                continue;
            }

            match self.process_cycle(messages).await {
                Ok(summary) => info!(
                    processed = summary.processed,
                    skipped = summary.skipped,
                    batches = summary.batches,
                    "poll cycle complete"
                ),
                Err(err) => error!("poll cycle failed, messages left for redelivery: {err:#}"),
            }
        }
        info!("consumer loop stopped");
        Ok(())
    }

    /// Processes one received batch end to end.
    ///
    /// Acknowledgment is the final step: messages are deleted only after
    /// every record of the cycle upserted, so a failure anywhere leaves the
    /// originals queued and the cycle is retried via redelivery.
    pub async fn process_cycle(&self, messages: Vec<QueueMessage>) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();
        let mut accepted: Vec<(QueueMessage, EmbedderInput)> = Vec::with_capacity(messages.len());
        for message in messages {
            match decode_body(&message.body) {
                Ok(input) => accepted.push((message, input)),
                Err(err) => {
                    warn!(
                        receive_count = message.receive_count,
                        "skipping malformed message: {err}"
                    );
                    summary.skipped += 1;
                }
            }
        }
        if accepted.is_empty() {
            return Ok(summary);
        }

        let texts: Vec<String> = accepted
            .iter()
            .map(|(_, input)| input.text.clone())
            .collect();
        let vectors = embed_texts(
            &self.embedder,
            &texts,
            self.config.embed_mode,
            self.config.embed_workers,
        )
        .await?;
        anyhow::ensure!(
            vectors.len() == accepted.len(),
            "embedding count {} mismatched input count {}",
            vectors.len(),
            accepted.len()
        );

        let records: Vec<VectorRecord> = accepted
            .iter()
            .zip(vectors)
            .map(|((_, input), values)| VectorRecord {
                id: input.vector_id(),
                values,
                metadata: input.metadata.clone(),
            })
            .collect();

        let batches = batch_by_size(records, MAX_UPSERT_BYTES);
        summary.batches = batches.len();
        for batch in &batches {
            self.index
                .upsert(batch)
                .await
                .context("vector upsert failed")?;
        }
        for (message, _) in &accepted {
            self.queue
                .delete(&message.receipt)
                .await
                .context("failed to acknowledge processed message")?;
        }
        summary.processed = accepted.len();
        Ok(summary)
    }
}

fn decode_body(body: &str) -> Result<EmbedderInput, EnvelopeError> {
    parse_message_body(body).and_then(|envelope| envelope.embedder_input())
}

async fn sleep_until_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataValue;

    #[test]
    fn valid_body_becomes_an_input() {
        let input = decode_body(r#"{"new": {"id": "7", "description": "blue hat"}}"#)
            .expect("decode");
        assert_eq!(input.vector_id(), "7");
        assert_eq!(input.text, "blue hat");
        assert_eq!(
            input.metadata.get("id"),
            Some(&MetadataValue::Str("7".into()))
        );
    }

    #[test]
    fn malformed_bodies_are_rejected_individually() {
        assert!(decode_body("{nope").is_err());
        assert!(decode_body(r#"{"new": {"description": "no id"}}"#).is_err());
        assert!(decode_body(r#"{"new": {"id": 3}}"#).is_err());
        // A bad neighbor does not poison a good body.
        assert!(decode_body(r#"{"new": {"id": 3, "description": "ok"}}"#).is_ok());
    }
}
