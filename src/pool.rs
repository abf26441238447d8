//! Embedding dispatch: serial, or a fixed-size worker pool over bounded channels.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use tokio::sync::{mpsc, Mutex};

use crate::embedder::Embedder;

/// How embedding work is scheduled within one poll cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum EmbedMode {
    /// One embedding call per input, in input order.
    Serial,
    /// Fan inputs across a fixed-size worker pool.
    Pool,
}

/// Embeds every text, returning vectors aligned with the input order.
///
/// Any failed input fails the whole batch. Silently dropping an update would
/// desync the index from the store with no retry path, so the cycle aborts
/// and redelivery retries it.
pub async fn embed_texts(
    embedder: &Arc<dyn Embedder>,
    texts: &[String],
    mode: EmbedMode,
    workers: usize,
) -> Result<Vec<Vec<f32>>> {
    match mode {
        EmbedMode::Serial => embed_serially(embedder, texts).await,
        EmbedMode::Pool => embed_with_pool(embedder, texts, workers).await,
    }
}

async fn embed_serially(embedder: &Arc<dyn Embedder>, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(texts.len());
    for (index, text) in texts.iter().enumerate() {
        let mut batch = embedder
            .embed_batch(&[text.as_str()])
            .await
            .with_context(|| format!("embedding input {index} failed"))?;
        vectors.push(
            batch
                .pop()
                .ok_or_else(|| anyhow!("embedder returned no vector for input {index}"))?,
        );
    }
    Ok(vectors)
}

async fn embed_with_pool(
    embedder: &Arc<dyn Embedder>,
    texts: &[String],
    workers: usize,
) -> Result<Vec<Vec<f32>>> {
    let total = texts.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let workers = workers.clamp(1, total);

    let (task_tx, task_rx) = mpsc::channel::<(usize, String)>(workers * 2);
    let task_rx = Arc::new(Mutex::new(task_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<(usize, Result<Vec<f32>>)>(workers * 2);

    for _ in 0..workers {
        let tasks = Arc::clone(&task_rx);
        let results = result_tx.clone();
        let embedder = Arc::clone(embedder);
        tokio::spawn(async move {
            loop {
                let next = { tasks.lock().await.recv().await };
                let Some((index, text)) = next else { break };
                let outcome = embedder.embed_batch(&[text.as_str()]).await.and_then(
                    |mut vectors| {
                        vectors
                            .pop()
                            .ok_or_else(|| anyhow!("embedder returned no vector"))
                    },
                );
                if results.send((index, outcome)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let pending: Vec<(usize, String)> = texts.iter().cloned().enumerate().collect();
    let dispatcher = tokio::spawn(async move {
        for item in pending {
            if task_tx.send(item).await.is_err() {
                break;
            }
        }
    });

    let mut collected: Vec<Option<Vec<f32>>> = vec![None; total];
    let mut received = 0usize;
    while received < total {
        let Some((index, outcome)) = result_rx.recv().await else {
            anyhow::bail!("embedding worker channel closed unexpectedly");
        };
        collected[index] =
            Some(outcome.with_context(|| format!("embedding input {index} failed"))?);
        received += 1;
    }
    let _ = dispatcher.await;

    collected
        .into_iter()
        .map(|slot| slot.ok_or_else(|| anyhow!("missing embedding result")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use async_trait::async_trait;

    struct ExplodingEmbedder;

    #[async_trait]
    impl Embedder for ExplodingEmbedder {
        async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            if inputs.iter().any(|text| text.contains("boom")) {
                anyhow::bail!("synthetic embedding failure");
            }
            Ok(inputs.iter().map(|_| vec![1.0]).collect())
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn serial_preserves_input_order() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(32));
        let inputs = texts(&["red shoes", "blue hat", "green scarf"]);
        let vectors = embed_texts(&embedder, &inputs, EmbedMode::Serial, 1)
            .await
            .expect("serial embed");
        let direct = embedder
            .embed_batch(&["red shoes", "blue hat", "green scarf"])
            .await
            .expect("direct embed");
        assert_eq!(vectors, direct);
    }

    #[tokio::test]
    async fn pool_matches_serial_output() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(32));
        let inputs: Vec<String> = (0..25).map(|i| format!("product number {i}")).collect();
        let serial = embed_texts(&embedder, &inputs, EmbedMode::Serial, 1)
            .await
            .expect("serial embed");
        let pooled = embed_texts(&embedder, &inputs, EmbedMode::Pool, 4)
            .await
            .expect("pooled embed");
        assert_eq!(pooled, serial);
    }

    #[tokio::test]
    async fn pool_fails_closed_on_worker_error() {
        let embedder: Arc<dyn Embedder> = Arc::new(ExplodingEmbedder);
        let inputs = texts(&["fine", "boom", "also fine"]);
        let outcome = embed_texts(&embedder, &inputs, EmbedMode::Pool, 2).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(16));
        let vectors = embed_texts(&embedder, &[], EmbedMode::Pool, 4)
            .await
            .expect("empty embed");
        assert!(vectors.is_empty());
    }
}
