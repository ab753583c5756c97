//! SQLite-backed store bootstrap
//!
//! The store is an external collaborator from the core's point of view: it
//! only needs transactional statement execution with savepoints and
//! serializable isolation, which SQLite provides by construction. This
//! module owns pool construction, the system-table migrations, and the
//! read/receipt helpers consumed by the gateway and the event processor.

use std::path::Path;
use std::time::Duration;

use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool, TypeInfo};

use crate::tables::{ChainId, Receipt};

/// System-wide table registry: one row per minted table.
pub const REGISTRY_TABLE: &str = "registry";
/// Per-(table, controller) privilege sets.
pub const SYSTEM_ACL_TABLE: &str = "system_acl";
/// Receipts persisted after every processed on-chain transaction.
pub const RECEIPTS_TABLE: &str = "system_txn_receipts";
/// Hashes of transactions that already ran, for de-duplication.
pub const EXECUTED_TXNS_TABLE: &str = "system_executed_txns";

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS registry (
        id TEXT PRIMARY KEY,
        controller TEXT NOT NULL,
        name TEXT NOT NULL,
        structure TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS system_acl (
        table_id TEXT NOT NULL,
        controller TEXT NOT NULL,
        privileges TEXT NOT NULL DEFAULT '',
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME,
        PRIMARY KEY (table_id, controller)
    )",
    "CREATE TABLE IF NOT EXISTS system_txn_receipts (
        chain_id INTEGER NOT NULL,
        txn_hash TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        table_id TEXT,
        error TEXT NOT NULL DEFAULT '',
        error_event_idx INTEGER NOT NULL DEFAULT 0,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (chain_id, txn_hash)
    )",
    "CREATE TABLE IF NOT EXISTS system_executed_txns (
        chain_id INTEGER NOT NULL,
        txn_hash TEXT NOT NULL,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (chain_id, txn_hash)
    )",
];

/// Open the store at `path`, creating the file if missing.
///
/// A single connection serializes all store access; SQLite permits limited
/// write concurrency anyway, and the processor serializes batches itself.
pub async fn connect(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Open an in-memory store, used by tests and local experimentation.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Create the system tables if they don't exist yet.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for ddl in MIGRATIONS {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

/// Execute a validated read statement and render the rows as JSON objects.
pub async fn execute_read_query(pool: &SqlitePool, sql: &str) -> Result<Value, sqlx::Error> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut object = Map::new();
        for (i, column) in row.columns().iter().enumerate() {
            object.insert(column.name().to_string(), column_value(row, i)?);
        }
        out.push(Value::Object(object));
    }
    Ok(Value::Array(out))
}

fn column_value(row: &SqliteRow, i: usize) -> Result<Value, sqlx::Error> {
    let type_name = row.columns()[i].type_info().name().to_uppercase();
    let value = match type_name.as_str() {
        "INTEGER" => row.try_get::<Option<i64>, _>(i)?.map(Value::from),
        "REAL" => row.try_get::<Option<f64>, _>(i)?.map(Value::from),
        "BOOLEAN" => row.try_get::<Option<bool>, _>(i)?.map(Value::from),
        "BLOB" => row
            .try_get::<Option<Vec<u8>>, _>(i)?
            .map(|bytes| Value::from(format!("0x{}", hex::encode(bytes)))),
        "NULL" => None,
        _ => row.try_get::<Option<String>, _>(i)?.map(Value::from),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Persist a receipt for a processed transaction.
pub async fn insert_receipt(pool: &SqlitePool, receipt: &Receipt) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR REPLACE INTO system_txn_receipts
         (chain_id, txn_hash, block_number, table_id, error, error_event_idx)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(receipt.chain_id)
    .bind(&receipt.txn_hash)
    .bind(receipt.block_number)
    .bind(&receipt.table_id)
    .bind(&receipt.error)
    .bind(receipt.error_event_idx)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch the receipt for a transaction, if one was persisted.
pub async fn get_receipt(
    pool: &SqlitePool,
    chain_id: ChainId,
    txn_hash: &str,
) -> Result<Option<Receipt>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT chain_id, txn_hash, block_number, table_id, error, error_event_idx
         FROM system_txn_receipts WHERE chain_id = ?1 AND txn_hash = ?2",
    )
    .bind(chain_id)
    .bind(txn_hash)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| Receipt {
        chain_id: row.get(0),
        txn_hash: row.get(1),
        block_number: row.get(2),
        table_id: row.get(3),
        error: row.get(4),
        error_event_idx: row.get(5),
    }))
}

/// Whether a transaction hash was already executed on a chain.
pub async fn is_executed(
    pool: &SqlitePool,
    chain_id: ChainId,
    txn_hash: &str,
) -> Result<bool, sqlx::Error> {
    let row: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM system_executed_txns WHERE chain_id = ?1 AND txn_hash = ?2",
    )
    .bind(chain_id)
    .bind(txn_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Record a transaction hash as executed.
pub async fn mark_executed(
    pool: &SqlitePool,
    chain_id: ChainId,
    txn_hash: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO system_executed_txns (chain_id, txn_hash) VALUES (?1, ?2)")
        .bind(chain_id)
        .bind(txn_hash)
        .execute(pool)
        .await?;
    Ok(())
}
