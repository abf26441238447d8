//! Backfill scanner draining pre-existing unprocessed rows into the queue.

use anyhow::{Context, Result};
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::envelope::ChangeEnvelope;
use crate::queue::ChangeQueue;
use crate::store::{ProductRow, TableName};

/// Default number of rows claimed per backfill transaction.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Totals reported by a completed backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Rows published to the queue and marked processed.
    pub rows_published: u64,
    /// Batch transactions committed.
    pub batches: u64,
}

/// SQL claiming one batch of unprocessed rows.
///
/// Skip-locked selection lets concurrent scanner instances claim disjoint
/// batches without ever double-publishing a row.
pub fn claim_sql(table: &TableName) -> String {
    format!(
        "SELECT {} FROM {} WHERE processed = FALSE ORDER BY id LIMIT $1 FOR UPDATE SKIP LOCKED",
        ProductRow::select_columns(),
        table.qualified()
    )
}

fn mark_processed_sql(table: &TableName) -> String {
    format!(
        "UPDATE {} SET processed = TRUE WHERE id = $1",
        table.qualified()
    )
}

fn unprocessed_count_sql(table: &TableName) -> String {
    format!(
        "SELECT COUNT(*) FROM {} WHERE processed = FALSE",
        table.qualified()
    )
}

/// Drains every unprocessed row into the queue, batch by batch.
///
/// A row is marked processed only after its publish call succeeded, and the
/// whole batch transaction rolls back on any error, so a crash mid-batch can
/// only cause re-publishing, never loss. Terminates once a claim returns no
/// rows, marking the bootstrap state complete when no unprocessed rows
/// remain anywhere (a concurrent scanner may still hold claims on some).
pub async fn run_backfill(
    client: &mut Client,
    queue: &ChangeQueue,
    table: &TableName,
    batch_size: usize,
) -> Result<BackfillSummary> {
    let batch_size = batch_size.max(1);
    let claim = claim_sql(table);
    let mark = mark_processed_sql(table);
    let remaining = unprocessed_count_sql(table);
    let mut summary = BackfillSummary::default();

    loop {
        let tx = client
            .transaction()
            .await
            .context("failed to begin backfill transaction")?;
        let rows = tx
            .query(&claim, &[&(batch_size as i64)])
            .await
            .context("failed to claim backfill batch")?;

        if rows.is_empty() {
            let left: i64 = tx
                .query_one(&remaining, &[])
                .await
                .context("failed to count unprocessed rows")?
                .get(0);
            if left == 0 {
                tx.execute("UPDATE bootstrapping_state SET is_complete = TRUE", &[])
                    .await
                    .context("failed to mark bootstrap complete")?;
                info!("no unprocessed rows remain, bootstrap marked complete");
            } else {
                debug!(
                    remaining = left,
                    "no claimable rows, remainder held by a concurrent scanner"
                );
            }
            tx.commit()
                .await
                .context("failed to commit final backfill transaction")?;
            break;
        }

        let claimed = rows.len();
        for row in &rows {
            let product = ProductRow::from_row(row)?;
            let envelope = ChangeEnvelope::from_row(product.change_value()?);
            let body = envelope.message_body()?;
            queue
                .send(&body)
                .await
                .with_context(|| format!("failed to publish change for row {}", product.id))?;
            tx.execute(&mark, &[&product.id])
                .await
                .with_context(|| format!("failed to mark row {} processed", product.id))?;
            summary.rows_published += 1;
        }
        tx.commit()
            .await
            .context("failed to commit backfill batch")?;
        summary.batches += 1;
        debug!(rows = claimed, "backfill batch committed");
    }

    info!(
        rows = summary.rows_published,
        batches = summary.batches,
        "backfill scan finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_uses_skip_locked_batching() {
        let table = TableName::new("public", "products_with_increment").expect("table");
        let sql = claim_sql(&table);
        assert!(sql.contains("processed = FALSE"));
        assert!(sql.contains("ORDER BY id"));
        assert!(sql.contains("LIMIT $1"));
        assert!(sql.ends_with("FOR UPDATE SKIP LOCKED"));
    }

    #[test]
    fn mark_targets_a_single_row() {
        let table = TableName::new("public", "products_with_increment").expect("table");
        assert_eq!(
            mark_processed_sql(&table),
            "UPDATE \"public\".\"products_with_increment\" SET processed = TRUE WHERE id = $1"
        );
    }
}
