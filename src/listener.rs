//! Live change listener bridging Postgres notifications onto the queue.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{stream, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::{info, warn};

use crate::queue::ChangeQueue;
use crate::store::quote_ident;

/// Delay before reconnecting after a dropped listen connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Why a listening session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenExit {
    /// A termination signal arrived; the connection was closed cleanly.
    Shutdown,
    /// The dedicated connection dropped; the caller should reconnect.
    ConnectionLost,
}

/// Listens on one dedicated connection until shutdown or connection loss.
///
/// The listen connection is held separately from the shared query client:
/// a connection that issued LISTEN must stay open for the life of the
/// subscription and cannot be returned to a pool. A failed publish drops
/// that one notification with a warning; the listener keeps running.
pub async fn listen_once(
    conn_str: &str,
    channel: &str,
    queue: &ChangeQueue,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ListenExit> {
    let (client, mut connection) = tokio_postgres::connect(conn_str, NoTls)
        .await
        .context("failed to open dedicated listen connection")?;

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let mut driver = tokio::spawn(async move {
        let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(notification)) => {
                    if notify_tx.send(notification).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("listen connection error: {err}");
                    break;
                }
            }
        }
    });

    client
        .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
        .await
        .context("failed to subscribe to change channel")?;
    info!(channel, "listening for live changes");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    drop(client);
                    driver.abort();
                    return Ok(ListenExit::Shutdown);
                }
            }
            notification = notify_rx.recv() => {
                let Some(notification) = notification else {
                    break;
                };
                if notification.channel() != channel {
                    continue;
                }
                let body = json!({
                    "channel": notification.channel(),
                    "payload": notification.payload(),
                })
                .to_string();
                if let Err(err) = queue.send(&body).await {
                    warn!("dropping change notification, publish failed: {err:#}");
                }
            }
            _ = &mut driver => {
                break;
            }
        }
    }

    warn!("listen connection lost");
    Ok(ListenExit::ConnectionLost)
}
