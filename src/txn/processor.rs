//! Serialized batch engine
//!
//! The processor owns exactly one batch token. `open_batch` consumes it and
//! terminating the batch returns it, so at most one mutating batch is in
//! flight per instance. Chain workers that must interleave run separate
//! processor instances over the shared pool.

use std::sync::Arc;

use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::acl::{Acl, AclError};
use crate::parsing::{CreateStmt, GrantStmt, MutatingStmt, WriteStmt};
use crate::tables::{address_hex, Address, Operation, Privileges, TableId};

use super::TxnError;

/// Executes mutating batches against the materialized store.
pub struct TxnProcessor {
    pool: SqlitePool,
    batch_slot: Arc<Semaphore>,
    max_row_count: usize,
    acl: Arc<dyn Acl>,
}

impl TxnProcessor {
    /// Create a processor. `max_row_count` of zero disables the row cap.
    pub fn new(pool: SqlitePool, max_row_count: usize, acl: Arc<dyn Acl>) -> Self {
        TxnProcessor {
            pool,
            batch_slot: Arc::new(Semaphore::new(1)),
            max_row_count,
            acl,
        }
    }

    /// Start a new batch of mutating actions.
    ///
    /// Waits until the single batch token is free: mutating batches are
    /// processed serially on purpose. The returned batch holds the token
    /// until it is committed or closed.
    pub async fn open_batch(&self) -> Result<Batch, TxnError> {
        let permit = self
            .batch_slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TxnError::Closed)?;

        // SQLite transactions are serializable; the begin fails fast if the
        // store is gone. The permit rides inside the batch so the token
        // returns on every exit path, including unwinds.
        let txn = self.pool.begin().await?;
        Ok(Batch {
            txn: Some(txn),
            acl: self.acl.clone(),
            max_row_count: self.max_row_count,
            _permit: permit,
        })
    }

    /// Close the processor gracefully: wait for any in-flight batch, then
    /// refuse to hand out new ones. Callers with a deadline race this
    /// against `tokio::time::timeout`; an abandoned close leaves the
    /// outstanding batch to its owner.
    pub async fn close(&self) {
        if self.batch_slot.acquire().await.is_ok() {
            self.batch_slot.close();
            tracing::info!("txn processor closed gracefully");
        }
    }
}

/// A transient handle owning one store transaction plus the processor's
/// batch token.
///
/// `commit` and `close` consume the batch, so a terminated batch can't be
/// reused and the token can't be returned twice.
impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("max_row_count", &self.max_row_count)
            .finish_non_exhaustive()
    }
}

pub struct Batch {
    txn: Option<Transaction<'static, Sqlite>>,
    acl: Arc<dyn Acl>,
    max_row_count: usize,
    _permit: OwnedSemaphorePermit,
}

impl Batch {
    /// Register a newly minted table:
    /// - insert the registry row
    /// - grant the controller the full mutation privilege set
    /// - execute the CREATE statement bound to the minted id
    ///
    /// Runs under a savepoint; any failure leaves the batch unchanged.
    pub async fn insert_table(
        &mut self,
        id: TableId,
        controller: &Address,
        description: &str,
        create: &CreateStmt,
    ) -> Result<(), TxnError> {
        let txn = self.txn.as_mut().ok_or(TxnError::Closed)?;
        savepoint(txn, "insert_table").await?;
        match insert_table_inner(txn, id, controller, description, create).await {
            Ok(()) => release(txn, "insert_table").await,
            Err(err) => {
                rollback_to(txn, "insert_table").await?;
                Err(err)
            }
        }
    }

    /// Apply a set of validated mutations against one table.
    ///
    /// Runs under a savepoint. Statements execute in input order and
    /// observe each other's effects; the first failure aborts the set.
    pub async fn exec_write_queries(
        &mut self,
        caller: &Address,
        table_id: TableId,
        statements: &[MutatingStmt],
    ) -> Result<(), TxnError> {
        if statements.is_empty() {
            tracing::warn!("no mutating statements to execute in batch");
            return Ok(());
        }

        let acl = self.acl.clone();
        let max_row_count = self.max_row_count;
        let txn = self.txn.as_mut().ok_or(TxnError::Closed)?;
        savepoint(txn, "write_queries").await?;
        match exec_write_queries_inner(txn, acl.as_ref(), max_row_count, caller, table_id, statements)
            .await
        {
            Ok(()) => release(txn, "write_queries").await,
            Err(err) => {
                rollback_to(txn, "write_queries").await?;
                Err(err)
            }
        }
    }

    /// Commit the batch's store transaction. The batch token returns to
    /// the processor when the batch drops.
    pub async fn commit(mut self) -> Result<(), TxnError> {
        if let Some(txn) = self.txn.take() {
            txn.commit().await?;
        }
        Ok(())
    }

    /// Close the batch, rolling back anything uncommitted.
    pub async fn close(mut self) -> Result<(), TxnError> {
        if let Some(txn) = self.txn.take() {
            txn.rollback().await?;
        }
        Ok(())
    }
}

async fn insert_table_inner(
    txn: &mut Transaction<'static, Sqlite>,
    id: TableId,
    controller: &Address,
    description: &str,
    create: &CreateStmt,
) -> Result<(), TxnError> {
    sqlx::query(
        "INSERT INTO registry (id, controller, name, structure, description)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(id.to_string())
    .bind(address_hex(controller))
    .bind(create.name_prefix())
    .bind(create.structure_hash())
    .bind(description)
    .execute(&mut **txn)
    .await?;

    // The owner starts with the full mutation privilege set.
    sqlx::query("INSERT INTO system_acl (table_id, controller, privileges) VALUES (?1, ?2, ?3)")
        .bind(id.to_string())
        .bind(address_hex(controller))
        .bind(Privileges::owner_defaults().to_abbreviations())
        .execute(&mut **txn)
        .await?;

    sqlx::query(&create.bound_query(id)).execute(&mut **txn).await?;
    Ok(())
}

async fn exec_write_queries_inner(
    txn: &mut Transaction<'static, Sqlite>,
    acl: &dyn Acl,
    max_row_count: usize,
    caller: &Address,
    table_id: TableId,
    statements: &[MutatingStmt],
) -> Result<(), TxnError> {
    let (table_name, before_row_count) = table_name_and_row_count(txn, table_id).await?;

    for statement in statements {
        let hint = statement.table_name();
        if !hint.is_empty() && hint != table_name {
            return Err(TxnError::NamePrefixMismatch {
                expected: table_name.clone(),
                got: hint.to_string(),
            });
        }

        match statement {
            MutatingStmt::Grant(grant) => exec_grant(txn, acl, caller, table_id, grant).await?,
            MutatingStmt::Write(write) => {
                exec_write(txn, acl, caller, table_id, write, before_row_count, max_row_count)
                    .await?
            }
        }
    }
    Ok(())
}

/// Look up the registered name and the current row count for a table.
async fn table_name_and_row_count(
    txn: &mut Transaction<'static, Sqlite>,
    id: TableId,
) -> Result<(String, i64), TxnError> {
    let name: Option<String> = sqlx::query_scalar("SELECT name FROM registry WHERE id = ?1")
        .bind(id.to_string())
        .fetch_optional(&mut **txn)
        .await?;
    let name = name.ok_or(TxnError::UnknownTable)?;

    // The stored relation name is generated from the id, never from user
    // input, so it is safe to splice.
    let count: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {}", id.sql_name()))
        .fetch_one(&mut **txn)
        .await?;
    Ok((name, count))
}

async fn exec_grant(
    txn: &mut Transaction<'static, Sqlite>,
    acl: &dyn Acl,
    caller: &Address,
    table_id: TableId,
    grant: &GrantStmt,
) -> Result<(), TxnError> {
    if !acl.is_owner(&mut **txn, caller, table_id).await? {
        return Err(TxnError::Acl(AclError::NotOwner));
    }

    for role in grant.roles() {
        let stored: Option<String> = sqlx::query_scalar(
            "SELECT privileges FROM system_acl WHERE table_id = ?1 AND controller = ?2",
        )
        .bind(table_id.to_string())
        .bind(address_hex(role))
        .fetch_optional(&mut **txn)
        .await?;

        match grant.operation() {
            Operation::Grant => {
                // Upsert with set union: granting twice is idempotent.
                let mut privileges = match &stored {
                    Some(csv) => Privileges::from_abbreviations(csv).map_err(AclError::from)?,
                    None => Privileges::default(),
                };
                for privilege in grant.privileges().iter() {
                    privileges.insert(*privilege);
                }
                sqlx::query(
                    "INSERT INTO system_acl (table_id, controller, privileges)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (table_id, controller)
                     DO UPDATE SET privileges = excluded.privileges,
                                   updated_at = CURRENT_TIMESTAMP",
                )
                .bind(table_id.to_string())
                .bind(address_hex(role))
                .bind(privileges.to_abbreviations())
                .execute(&mut **txn)
                .await?;
            }
            Operation::Revoke => {
                let Some(csv) = &stored else {
                    continue;
                };
                let mut privileges =
                    Privileges::from_abbreviations(csv).map_err(AclError::from)?;
                for privilege in grant.privileges().iter() {
                    privileges.remove(*privilege);
                }
                sqlx::query(
                    "UPDATE system_acl
                     SET privileges = ?3, updated_at = CURRENT_TIMESTAMP
                     WHERE table_id = ?1 AND controller = ?2",
                )
                .bind(table_id.to_string())
                .bind(address_hex(role))
                .bind(privileges.to_abbreviations())
                .execute(&mut **txn)
                .await?;
            }
            other => return Err(TxnError::UnknownGrantOperation(other)),
        }
    }
    Ok(())
}

async fn exec_write(
    txn: &mut Transaction<'static, Sqlite>,
    acl: &dyn Acl,
    caller: &Address,
    table_id: TableId,
    write: &WriteStmt,
    before_row_count: i64,
    max_row_count: usize,
) -> Result<(), TxnError> {
    acl.check_privileges(&mut **txn, caller, table_id, write.operation())
        .await?;

    let result = sqlx::query(&write.desugared_query(table_id))
        .execute(&mut **txn)
        .await?;

    if max_row_count > 0 && write.operation() == Operation::Insert {
        let after = before_row_count + result.rows_affected() as i64;
        if after > max_row_count as i64 {
            return Err(TxnError::RowCountExceeded {
                before: before_row_count,
                after,
            });
        }
    }
    Ok(())
}

async fn savepoint(txn: &mut Transaction<'static, Sqlite>, name: &str) -> Result<(), TxnError> {
    sqlx::query(&format!("SAVEPOINT {}", name))
        .execute(&mut **txn)
        .await?;
    Ok(())
}

async fn release(txn: &mut Transaction<'static, Sqlite>, name: &str) -> Result<(), TxnError> {
    sqlx::query(&format!("RELEASE SAVEPOINT {}", name))
        .execute(&mut **txn)
        .await?;
    Ok(())
}

async fn rollback_to(txn: &mut Transaction<'static, Sqlite>, name: &str) -> Result<(), TxnError> {
    sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", name))
        .execute(&mut **txn)
        .await?;
    sqlx::query(&format!("RELEASE SAVEPOINT {}", name))
        .execute(&mut **txn)
        .await?;
    Ok(())
}
