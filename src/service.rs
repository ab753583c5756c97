//! Gateway service
//!
//! The read-side surface of the node: validated read queries run directly
//! against the materialized store, and receipts of processed transactions
//! can be looked up by hash. Mutations never enter here; they arrive as
//! chain events.

use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::parsing::{ParsingError, QueryValidator, ValidatedQuery};
use crate::store;
use crate::tables::{ChainId, Receipt};

/// Gateway errors.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Parsing(#[from] ParsingError),

    /// A mutating statement was submitted on the read path.
    #[error("the statement isn't a read query")]
    NotReadQuery,

    #[error("store: {0}")]
    Store(#[from] sqlx::Error),
}

impl ServiceError {
    /// Whether the failure was caused by the client's input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ServiceError::Parsing(_) | ServiceError::NotReadQuery)
    }
}

/// The validator node's public query surface.
pub struct Service {
    pool: SqlitePool,
    validator: QueryValidator,
}

impl Service {
    pub fn new(pool: SqlitePool, validator: QueryValidator) -> Self {
        Service { pool, validator }
    }

    /// Validate and execute a read query, returning rows as JSON objects.
    pub async fn run_read_query(&self, statement: &str) -> Result<Value, ServiceError> {
        let ValidatedQuery::Read(read) = self.validator.validate_run_sql(statement)? else {
            return Err(ServiceError::NotReadQuery);
        };
        Ok(store::execute_read_query(&self.pool, read.raw_query()).await?)
    }

    /// Validate a CREATE TABLE statement ahead of minting, returning its
    /// structure hash.
    pub async fn validate_create_table(&self, statement: &str) -> Result<String, ServiceError> {
        let create = self.validator.validate_create_table(statement)?;
        Ok(create.structure_hash().to_string())
    }

    /// Fetch the receipt of a processed transaction, if any.
    pub async fn receipt(
        &self,
        chain_id: ChainId,
        txn_hash: &str,
    ) -> Result<Option<Receipt>, ServiceError> {
        Ok(store::get_receipt(&self.pool, chain_id, txn_hash).await?)
    }
}
