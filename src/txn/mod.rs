//! Transaction processing module
//!
//! Provides the serialized batch engine that materializes validated
//! mutations:
//! - one batch per on-chain event transaction, one store transaction per batch
//! - ACL enforcement on every write, row-cap enforcement on every insert
//! - structured failures for receipt emission

mod processor;

pub use processor::{Batch, TxnProcessor};

use thiserror::Error;

use crate::acl::AclError;
use crate::tables::Operation;

/// Batch execution errors.
///
/// Any of these aborts the whole batch; the processor never retries.
#[derive(Error, Debug)]
pub enum TxnError {
    /// The processor was closed; no new batches are handed out.
    #[error("processor is closed")]
    Closed,

    /// The registry has no row for the requested table id.
    #[error("the table id doesn't exist")]
    UnknownTable,

    /// A statement's name hint disagrees with the registered table name.
    #[error("table name prefix doesn't match (exp {expected}, got {got})")]
    NamePrefixMismatch { expected: String, got: String },

    /// The per-table row cap would be breached. Surfaced as its own kind so
    /// the receipt layer can record the quota breach.
    #[error("row count exceeded (before {before}, after {after})")]
    RowCountExceeded { before: i64, after: i64 },

    /// A grant statement carried an operation that isn't grant or revoke.
    #[error("unknown grant operation: {0}")]
    UnknownGrantOperation(Operation),

    #[error(transparent)]
    Acl(#[from] AclError),

    #[error("store: {0}")]
    Store(#[from] sqlx::Error),
}
