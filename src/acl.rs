//! Access-control checks for table mutations
//!
//! Ownership comes from the registry; mutation privileges come from the
//! system ACL table. Both checks run on the batch's own transaction so a
//! grant earlier in a batch is visible to later statements of the same
//! batch.

use async_trait::async_trait;
use sqlx::SqliteConnection;
use thiserror::Error;

use crate::tables::{address_hex, Address, Operation, Privilege, Privileges, TableId, TypeError};

/// ACL errors.
#[derive(Error, Debug)]
pub enum AclError {
    /// The caller lacks the privilege the operation needs.
    #[error("{caller} can't {operation} on table {table_id}: requires privilege {required}")]
    Denied {
        caller: String,
        table_id: TableId,
        operation: Operation,
        required: Privilege,
    },

    /// Grants and revokes are reserved to the table owner.
    #[error("non-owner cannot execute grant or revoke")]
    NotOwner,

    /// The stored privileges entry failed to round-trip.
    #[error("corrupt privileges entry: {0}")]
    Corrupt(#[from] TypeError),

    #[error("acl lookup: {0}")]
    Store(#[from] sqlx::Error),
}

/// The API for access-control rule checks.
#[async_trait]
pub trait Acl: Send + Sync {
    /// Check that `caller` can execute `operation` on `table_id`.
    async fn check_privileges(
        &self,
        conn: &mut SqliteConnection,
        caller: &Address,
        table_id: TableId,
        operation: Operation,
    ) -> Result<(), AclError>;

    /// Whether `caller` is the registered controller of `table_id`.
    async fn is_owner(
        &self,
        conn: &mut SqliteConnection,
        caller: &Address,
        table_id: TableId,
    ) -> Result<bool, AclError>;
}

/// ACL provider backed by the registry and the system ACL table.
pub struct RegistryAcl;

#[async_trait]
impl Acl for RegistryAcl {
    async fn check_privileges(
        &self,
        conn: &mut SqliteConnection,
        caller: &Address,
        table_id: TableId,
        operation: Operation,
    ) -> Result<(), AclError> {
        // Operations outside the privilege map need no row-level grant.
        if operation.required_privilege().is_none() {
            return Ok(());
        }

        let stored: Option<String> = sqlx::query_scalar(
            "SELECT privileges FROM system_acl WHERE table_id = ?1 AND controller = ?2",
        )
        .bind(table_id.to_string())
        .bind(address_hex(caller))
        .fetch_optional(&mut *conn)
        .await?;

        let privileges = match stored {
            Some(csv) => Privileges::from_abbreviations(&csv)?,
            None => Privileges::default(),
        };

        privileges
            .can_execute(operation)
            .map_err(|required| AclError::Denied {
                caller: address_hex(caller),
                table_id,
                operation,
                required,
            })
    }

    async fn is_owner(
        &self,
        conn: &mut SqliteConnection,
        caller: &Address,
        table_id: TableId,
    ) -> Result<bool, AclError> {
        let controller: Option<String> =
            sqlx::query_scalar("SELECT controller FROM registry WHERE id = ?1")
                .bind(table_id.to_string())
                .fetch_optional(&mut *conn)
                .await?;
        Ok(controller.is_some_and(|c| c == address_hex(caller)))
    }
}
