//! Postgres connectivity and product-table helpers shared by binaries.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio_postgres::{Client, NoTls, Row};
use tracing::error;

/// Notification channel the change trigger publishes on.
pub const CHANGE_CHANNEL: &str = "table_change";

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "table name is required");
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Returns the raw schema string.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Returns the raw table string.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name of the change-notification trigger attached to this table.
    pub fn change_trigger_name(&self) -> String {
        format!(
            "{}_{}_notify_change",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table)
        )
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// Connects to the change table store and spawns the connection driver.
pub async fn connect(conn_str: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
        .await
        .context("failed to connect to the change table store")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!("postgres connection error: {err}");
        }
    });
    Ok(client)
}

/// Product row snapshot read by the backfill scanner.
#[derive(Debug, Clone, Serialize)]
pub struct ProductRow {
    /// Primary key.
    pub id: i32,
    /// Display name.
    pub name: Option<String>,
    /// Stock-keeping unit.
    pub sku: Option<String>,
    /// Text used as embedding input downstream.
    pub description: Option<String>,
    /// Price, widened to f64 for transit.
    pub price: Option<f64>,
    /// Last-modified stamp rendered as text.
    pub last_updated: Option<String>,
    /// Whether the row has already been enqueued.
    pub processed: bool,
}

impl ProductRow {
    /// Column list the scanner selects, with transit-friendly casts.
    pub fn select_columns() -> &'static str {
        "id, name, sku, description, price::float8 AS price, \
         last_updated::text AS last_updated, processed"
    }

    /// Decodes one selected row.
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            sku: row.try_get("sku")?,
            description: row.try_get("description")?,
            price: row.try_get("price")?,
            last_updated: row.try_get("last_updated")?,
            processed: row.try_get("processed")?,
        })
    }

    /// Renders the snapshot as the envelope's row object.
    pub fn change_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Reads the singleton bootstrap marker; absent rows read as incomplete.
pub async fn bootstrap_complete(client: &Client) -> Result<bool> {
    let row = client
        .query_opt("SELECT is_complete FROM bootstrapping_state", &[])
        .await
        .context("failed to read bootstrapping state")?;
    Ok(row.map(|r| r.get(0)).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_are_quoted() {
        let table = TableName::new("public", "products_with_increment").expect("table");
        assert_eq!(table.qualified(), "\"public\".\"products_with_increment\"");
    }

    #[test]
    fn embedded_quotes_are_escaped() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn blank_names_are_rejected() {
        assert!(TableName::new(" ", "t").is_err());
        assert!(TableName::new("s", "").is_err());
    }

    #[test]
    fn trigger_name_is_identifier_safe() {
        let table = TableName::new("public", "products-v2").expect("table");
        assert_eq!(
            table.change_trigger_name(),
            "public_products_v2_notify_change"
        );
    }

    #[test]
    fn snapshot_serializes_all_columns() {
        let row = ProductRow {
            id: 42,
            name: Some("Runner".into()),
            sku: Some("SKU-AB-12".into()),
            description: Some("red shoes".into()),
            price: Some(129.5),
            last_updated: None,
            processed: false,
        };
        let value = row.change_value().expect("serialize");
        assert_eq!(value["id"], serde_json::json!(42));
        assert_eq!(value["description"], serde_json::json!("red shoes"));
        assert_eq!(value["processed"], serde_json::json!(false));
    }
}
