//! On-chain event intake
//!
//! The chain feed itself (subscriptions, reorg handling, block-depth delay)
//! is an external collaborator; this module defines the event shapes it
//! delivers and the processor that turns one on-chain transaction into one
//! store batch plus one receipt.

mod processor;

pub use processor::{EventProcessor, EventProcessorConfig};

use thiserror::Error;

use crate::tables::{Address, ChainId, TableId};
use crate::txn::TxnError;

/// A table-lifecycle or row-mutation intent decoded from a registry
/// contract event.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// The contract minted a table id for a validated CREATE statement.
    CreateTable {
        table_id: TableId,
        owner: Address,
        statement: String,
        description: String,
    },
    /// A caller submitted a mutating SQL payload for an existing table.
    RunSql {
        caller: Address,
        table_id: TableId,
        statement: String,
    },
}

/// All events decoded from one on-chain transaction. One transaction maps
/// to exactly one batch and one receipt.
#[derive(Debug, Clone)]
pub struct TxnEvents {
    pub chain_id: ChainId,
    pub txn_hash: String,
    pub block_number: i64,
    pub events: Vec<EventKind>,
}

/// Infrastructure failures while processing a transaction. These are the
/// retriable class: the feed re-attempts after its configured backoff.
/// User-caused failures never surface here; they become failure receipts.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("txn processor: {0}")]
    Txn(TxnError),

    #[error("store: {0}")]
    Store(#[from] sqlx::Error),
}
