//! Durable change queue client with visibility timeouts and dead-lettering.
//!
//! The queue itself is a Redis list. Receiving moves a message onto a
//! per-delivery processing key whose name carries its visibility deadline;
//! deleting the processing key acknowledges the message. Deliveries whose
//! deadline lapses are swept back onto the queue, and messages that have
//! been delivered too many times are moved to the dead-letter list instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config, Connection, Pool, Runtime};

use crate::fingerprint;

/// Tunable knobs for queue delivery behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// List key holding pending change messages.
    pub queue_key: String,
    /// List key receiving messages past the redrive limit.
    pub dead_letter_key: String,
    /// How long a received message stays invisible before redelivery.
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_receive_count: u32,
    /// Long-poll wait applied to the first receive of each cycle.
    pub receive_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_key: "rowstream:changes".to_string(),
            dead_letter_key: "rowstream:changes:dead".to_string(),
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 4,
            receive_wait: Duration::from_secs(5),
        }
    }
}

/// One received message plus the handle needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Raw message body as published.
    pub body: String,
    /// How many times this body has been delivered so far.
    pub receive_count: u64,
    /// Handle passed back to [`ChangeQueue::delete`] on success.
    pub receipt: ReceiptHandle,
}

/// Acknowledgment handle for a single delivery.
#[derive(Debug, Clone)]
pub struct ReceiptHandle {
    processing_key: String,
    counts_field: String,
}

/// Client for the durable change queue.
pub struct ChangeQueue {
    pool: Pool,
    config: QueueConfig,
    consumer_tag: String,
    sequence: AtomicU64,
}

impl ChangeQueue {
    /// Builds a queue client backed by the Redis instance at `url`.
    pub fn connect(url: &str, config: QueueConfig) -> Result<Self> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .context("failed to build queue connection pool")?;
        Ok(Self {
            pool,
            config,
            consumer_tag: format!("consumer-{}", std::process::id()),
            sequence: AtomicU64::new(0),
        })
    }

    /// Queue configuration in effect.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Publishes a message body onto the queue.
    pub async fn send(&self, body: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .lpush(&self.config.queue_key, body)
            .await
            .context("failed to publish queue message")?;
        Ok(())
    }

    /// Receives up to `max_messages`, long-polling for the first one.
    ///
    /// Each received message becomes invisible until its visibility deadline
    /// or until it is deleted, whichever comes first.
    pub async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>> {
        let mut conn = self.conn().await?;
        let mut messages = Vec::new();
        if max_messages == 0 {
            return Ok(messages);
        }

        let first_key = self.next_processing_key();
        // A zero BRPOPLPUSH timeout would block forever; fall back to a
        // non-blocking pop when no long-poll wait is configured.
        let wait = self.config.receive_wait.as_secs_f64();
        let first: Option<String> = if wait > 0.0 {
            conn.brpoplpush(&self.config.queue_key, &first_key, wait)
                .await
                .context("queue receive failed")?
        } else {
            conn.rpoplpush(&self.config.queue_key, &first_key)
                .await
                .context("queue receive failed")?
        };
        let Some(body) = first else {
            return Ok(messages);
        };
        messages.push(self.admit(&mut conn, first_key, body).await?);

        while messages.len() < max_messages {
            let key = self.next_processing_key();
            let more: Option<String> = conn
                .rpoplpush(&self.config.queue_key, &key)
                .await
                .context("queue receive failed")?;
            match more {
                Some(body) => messages.push(self.admit(&mut conn, key, body).await?),
                None => break,
            }
        }
        Ok(messages)
    }

    /// Acknowledges one delivery; the message will not be delivered again.
    pub async fn delete(&self, receipt: &ReceiptHandle) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(&receipt.processing_key)
            .await
            .context("failed to delete queue message")?;
        let _: () = conn
            .hdel(self.counts_key(), &receipt.counts_field)
            .await
            .context("failed to clear delivery count")?;
        Ok(())
    }

    /// Sweeps deliveries whose visibility deadline lapsed.
    ///
    /// Expired deliveries are pushed back onto the queue for another
    /// attempt; bodies already delivered `max_receive_count` times move to
    /// the dead-letter list instead.
    pub async fn recover_expired(&self) -> Result<RecoverySummary> {
        let mut conn = self.conn().await?;
        let prefix = self.processing_prefix();
        let keys: Vec<String> = conn
            .keys(format!("{prefix}:*"))
            .await
            .context("failed to list in-flight deliveries")?;
        let now = unix_millis();
        let mut summary = RecoverySummary::default();
        for key in keys {
            let Some(deadline) = parse_deadline(&prefix, &key) else {
                continue;
            };
            if deadline > now {
                continue;
            }
            let body: Option<String> = conn.lindex(&key, 0).await?;
            if let Some(body) = body {
                let field = fingerprint::hex_fingerprint(body.as_bytes());
                let delivered: Option<u64> = conn.hget(self.counts_key(), &field).await?;
                if delivered.unwrap_or(0) >= u64::from(self.config.max_receive_count) {
                    let _: () = conn.lpush(&self.config.dead_letter_key, &body).await?;
                    let _: () = conn.hdel(self.counts_key(), &field).await?;
                    summary.dead_lettered += 1;
                } else {
                    let _: () = conn.lpush(&self.config.queue_key, &body).await?;
                    summary.requeued += 1;
                }
            }
            let _: () = conn.del(&key).await?;
        }
        Ok(summary)
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .context("failed to check out queue connection")
    }

    async fn admit(
        &self,
        conn: &mut Connection,
        processing_key: String,
        body: String,
    ) -> Result<QueueMessage> {
        let counts_field = fingerprint::hex_fingerprint(body.as_bytes());
        let receive_count: u64 = conn
            .hincr(self.counts_key(), &counts_field, 1)
            .await
            .context("failed to record delivery count")?;
        Ok(QueueMessage {
            body,
            receive_count,
            receipt: ReceiptHandle {
                processing_key,
                counts_field,
            },
        })
    }

    fn processing_prefix(&self) -> String {
        format!("{}:processing", self.config.queue_key)
    }

    fn counts_key(&self) -> String {
        format!("{}:receive-counts", self.config.queue_key)
    }

    fn next_processing_key(&self) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let deadline = unix_millis() + self.config.visibility_timeout.as_millis() as u64;
        format!(
            "{}:{}:{}:{}",
            self.processing_prefix(),
            deadline,
            self.consumer_tag,
            sequence
        )
    }
}

/// Counts of messages moved during an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Messages returned to the queue for redelivery.
    pub requeued: u64,
    /// Messages moved to the dead-letter list.
    pub dead_lettered: u64,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn parse_deadline(prefix: &str, key: &str) -> Option<u64> {
    let rest = key.strip_prefix(prefix)?.strip_prefix(':')?;
    let deadline = rest.split(':').next()?;
    deadline.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_survives_key_round_trip() {
        let prefix = "rowstream:changes:processing";
        let key = format!("{prefix}:1723200000123:consumer-42:7");
        assert_eq!(parse_deadline(prefix, &key), Some(1723200000123));
    }

    #[test]
    fn foreign_keys_are_ignored() {
        let prefix = "rowstream:changes:processing";
        assert_eq!(parse_deadline(prefix, "other:key"), None);
        assert_eq!(
            parse_deadline(prefix, "rowstream:changes:processing:not-a-number:x:1"),
            None
        );
    }

    #[test]
    fn defaults_match_delivery_contract() {
        let config = QueueConfig::default();
        assert_eq!(config.max_receive_count, 4);
        assert!(config.visibility_timeout >= Duration::from_secs(1));
        assert_ne!(config.queue_key, config.dead_letter_key);
    }
}
