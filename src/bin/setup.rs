use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;
use rowstream::store::{self, quote_ident, TableName};
use tokio_postgres::Client;

#[derive(Parser, Debug)]
#[command(
    name = "rowstream-setup",
    about = "Ensure the product table, bootstrap marker, and change trigger exist"
)]
struct SetupCli {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

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
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SetupCli::parse();
    let table = TableName::new(cli.schema, cli.table)?;
    let channel = cli.channel.trim();
    anyhow::ensure!(!channel.is_empty(), "channel must not be empty");
    anyhow::ensure!(
        channel
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_'),
        "channel must be a plain identifier"
    );

    let mut client = store::connect(&cli.database_url).await?;

    let total_steps = 4;
    let mut completed = 0usize;

    render_progress(completed, total_steps, "ensuring product table");
    ensure_product_table(&mut client, &table).await?;
    completed += 1;
    render_progress(completed, total_steps, "ensuring bootstrap marker");
    ensure_bootstrap_marker(&mut client).await?;
    completed += 1;
    render_progress(completed, total_steps, "ensuring notify function");
    ensure_notify_function(&mut client, channel).await?;
    completed += 1;
    render_progress(completed, total_steps, "ensuring change trigger");
    ensure_change_trigger(&mut client, &table).await?;
    completed += 1;
    render_progress(completed, total_steps, "complete");
    println!();
    println!(
        "Ensured change-capture schema exists for {}.",
        table.qualified()
    );
    Ok(())
}

async fn ensure_product_table(client: &mut Client, table: &TableName) -> Result<()> {
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id SERIAL PRIMARY KEY,
            name TEXT,
            sku TEXT,
            description TEXT,
            price NUMERIC(10, 2),
            last_updated TIMESTAMP DEFAULT NOW(),
            processed BOOLEAN NOT NULL DEFAULT FALSE
        )",
        table.qualified()
    );
    client
        .execute(&ddl, &[])
        .await
        .context("failed to ensure product table")?;
    Ok(())
}

async fn ensure_bootstrap_marker(client: &mut Client) -> Result<()> {
    client
        .execute(
            "CREATE TABLE IF NOT EXISTS bootstrapping_state (
                is_complete BOOLEAN NOT NULL DEFAULT FALSE
            )",
            &[],
        )
        .await
        .context("failed to ensure bootstrapping_state table")?;
    let rows: i64 = client
        .query_one("SELECT COUNT(*) FROM bootstrapping_state", &[])
        .await?
        .get(0);
    if rows == 0 {
        client
            .execute(
                "INSERT INTO bootstrapping_state (is_complete) VALUES (FALSE)",
                &[],
            )
            .await
            .context("failed to seed bootstrapping_state row")?;
    }
    Ok(())
}

async fn ensure_notify_function(client: &mut Client, channel: &str) -> Result<()> {
    let ddl = format!(
        "CREATE OR REPLACE FUNCTION notify_table_change() RETURNS trigger AS $body$
        BEGIN
            PERFORM pg_notify('{channel}', json_build_object('new', row_to_json(NEW))::text);
            RETURN NEW;
        END;
        $body$ LANGUAGE plpgsql"
    );
    client
        .execute(&ddl, &[])
        .await
        .context("failed to ensure notify function")?;
    Ok(())
}

async fn ensure_change_trigger(client: &mut Client, table: &TableName) -> Result<()> {
    let trigger = quote_ident(&table.change_trigger_name());
    let drop = format!("DROP TRIGGER IF EXISTS {} ON {}", trigger, table.qualified());
    client
        .execute(&drop, &[])
        .await
        .context("failed to drop stale change trigger")?;
    let create = format!(
        "CREATE TRIGGER {} AFTER INSERT OR UPDATE ON {} \
         FOR EACH ROW EXECUTE FUNCTION notify_table_change()",
        trigger,
        table.qualified()
    );
    client
        .execute(&create, &[])
        .await
        .context("failed to create change trigger")?;
    Ok(())
}

fn render_progress(done: usize, total: usize, label: &str) {
    if total == 0 {
        return;
    }
    let pct = (done as f64 / total as f64) * 100.0;
    print!("\r[{}/{}] {:.1}% {}", done, total, pct, label);
    let _ = io::stdout().flush();
}
