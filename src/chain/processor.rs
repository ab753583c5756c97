//! Event-to-batch driver
//!
//! Applies the events of one on-chain transaction inside a single batch and
//! persists the resulting receipt. Validation, ACL and quota failures are
//! recorded in the receipt; store failures abort processing so the feed can
//! re-attempt after backoff.

use sqlx::SqlitePool;
use thiserror::Error;

use crate::parsing::{ParsingError, QueryValidator, ValidatedQuery};
use crate::store;
use crate::tables::{Receipt, TableId};
use crate::txn::{Batch, TxnError, TxnProcessor};

use super::{EventError, EventKind, TxnEvents};

/// Configuration of the event processor.
#[derive(Debug, Clone)]
pub struct EventProcessorConfig {
    /// Skip transactions whose hash is already recorded as executed.
    pub dedup_executed_txns: bool,
}

impl Default for EventProcessorConfig {
    fn default() -> Self {
        EventProcessorConfig {
            dedup_executed_txns: true,
        }
    }
}

/// Turns decoded chain events into batches and receipts.
pub struct EventProcessor {
    validator: QueryValidator,
    processor: TxnProcessor,
    pool: SqlitePool,
    config: EventProcessorConfig,
}

/// A failure while applying a single event. Parsing and processor kinds
/// that stem from the user's payload become receipt errors; the rest are
/// infrastructure failures.
#[derive(Error, Debug)]
enum ApplyError {
    #[error(transparent)]
    Parsing(#[from] ParsingError),

    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error("on-chain payload is a read query")]
    ReadPayload,
}

impl EventProcessor {
    pub fn new(
        validator: QueryValidator,
        processor: TxnProcessor,
        pool: SqlitePool,
        config: EventProcessorConfig,
    ) -> Self {
        EventProcessor {
            validator,
            processor,
            pool,
            config,
        }
    }

    /// Process all events of one on-chain transaction in a single batch.
    ///
    /// On success the batch commits and a receipt with an empty error is
    /// persisted. On a user-caused failure the batch rolls back and the
    /// receipt records the failure kind plus the index of the failing
    /// event. Either way the transaction hash is marked executed.
    pub async fn process_txn(&self, txn: &TxnEvents) -> Result<Receipt, EventError> {
        if self.config.dedup_executed_txns
            && store::is_executed(&self.pool, txn.chain_id, &txn.txn_hash).await?
        {
            tracing::warn!(
                chain_id = txn.chain_id,
                txn_hash = %txn.txn_hash,
                "transaction already executed, skipping"
            );
            let stored = store::get_receipt(&self.pool, txn.chain_id, &txn.txn_hash).await?;
            return Ok(stored.unwrap_or_else(|| {
                Receipt::success(txn.chain_id, &txn.txn_hash, txn.block_number, None)
            }));
        }

        let mut batch = self.processor.open_batch().await.map_err(EventError::Txn)?;

        let mut table_id = None;
        let mut failure: Option<(i64, String)> = None;
        for (idx, event) in txn.events.iter().enumerate() {
            match self.apply_event(&mut batch, event).await {
                Ok(id) => table_id = Some(id),
                // Infrastructure failures roll back without a receipt so
                // the feed can re-attempt after its backoff.
                Err(ApplyError::Txn(err @ (TxnError::Store(_) | TxnError::Closed))) => {
                    let _ = batch.close().await;
                    return Err(EventError::Txn(err));
                }
                Err(err) => {
                    let message = err.to_string();
                    tracing::info!(
                        chain_id = txn.chain_id,
                        txn_hash = %txn.txn_hash,
                        event_idx = idx,
                        error = %message,
                        "event failed, aborting batch"
                    );
                    failure = Some((idx as i64, message));
                    break;
                }
            }
        }

        let receipt = match failure {
            None => {
                batch.commit().await.map_err(EventError::Txn)?;
                Receipt::success(txn.chain_id, &txn.txn_hash, txn.block_number, table_id)
            }
            Some((idx, message)) => {
                batch.close().await.map_err(EventError::Txn)?;
                Receipt::failure(txn.chain_id, &txn.txn_hash, txn.block_number, message, idx)
            }
        };

        store::insert_receipt(&self.pool, &receipt).await?;
        store::mark_executed(&self.pool, txn.chain_id, &txn.txn_hash).await?;
        Ok(receipt)
    }

    async fn apply_event(
        &self,
        batch: &mut Batch,
        event: &EventKind,
    ) -> Result<TableId, ApplyError> {
        match event {
            EventKind::CreateTable {
                table_id,
                owner,
                statement,
                description,
            } => {
                let create = self.validator.validate_create_table(statement)?;
                batch
                    .insert_table(*table_id, owner, description, &create)
                    .await?;
                Ok(*table_id)
            }
            EventKind::RunSql {
                caller,
                table_id,
                statement,
            } => {
                let ValidatedQuery::Mutations(statements) =
                    self.validator.validate_run_sql(statement)?
                else {
                    return Err(ApplyError::ReadPayload);
                };
                batch
                    .exec_write_queries(caller, *table_id, &statements)
                    .await?;
                Ok(*table_id)
            }
        }
    }
}
