//! Processor checkpoint persistence.
//!
//! One row per `(processor_id, partition, version)` holding the last processed
//! global position as a 19-digit token. Writes are compare-and-swap against
//! the position the writer last saw, inside the caller's transaction, so a
//! checkpoint only advances together with the side effects it covers.

use tracing::{debug, instrument, warn};

use eventline_core::{CheckpointToken, GlobalPosition, ProcessorInstanceId};

use crate::sql::{Sql, SqlError, SqlExecutor, SqlRow, SqlTransaction};

/// Identifies one processor's checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub processor_id: String,
    pub version: u32,
    pub partition: String,
}

impl CheckpointKey {
    pub fn new(processor_id: impl Into<String>, version: u32, partition: impl Into<String>) -> Self {
        Self {
            processor_id: processor_id.into(),
            version,
            partition: partition.into(),
        }
    }
}

/// Outcome of a compare-and-swap checkpoint write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreCheckpointResult {
    Applied,
    /// Another writer already stored exactly this position.
    IgnoredDuplicate,
    /// The row holds something other than the expected previous position.
    Conflict { current: Option<GlobalPosition> },
}

fn select_checkpoint(key: &CheckpointKey) -> Sql {
    Sql::new(
        "read_checkpoint",
        "SELECT last_processed_checkpoint FROM processors \
         WHERE processor_id = $1 AND partition = $2 AND version = $3",
    )
    .bind(key.processor_id.as_str())
    .bind(key.partition.as_str())
    .bind(key.version)
}

fn decode_checkpoint(rows: &[SqlRow]) -> Result<Option<GlobalPosition>, SqlError> {
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    let raw = row.try_string("last_processed_checkpoint")?;
    let token: CheckpointToken = raw.parse().map_err(|e| SqlError::Decode {
        column: "last_processed_checkpoint".to_string(),
        message: format!("{e}"),
    })?;
    Ok(Some(token.position()))
}

fn encode_checkpoint(position: GlobalPosition) -> Result<String, SqlError> {
    position
        .to_token()
        .map(CheckpointToken::into_string)
        .map_err(|e| SqlError::Other {
            operation: "store_checkpoint".to_string(),
            message: e.to_string(),
        })
}

/// Last stored position, or `None` when the processor never checkpointed.
#[instrument(skip_all, fields(processor_id = %key.processor_id), err)]
pub async fn read_checkpoint(
    executor: &dyn SqlExecutor,
    key: &CheckpointKey,
) -> Result<Option<GlobalPosition>, SqlError> {
    let rows = executor.query(&select_checkpoint(key)).await?;
    decode_checkpoint(&rows)
}

/// Same as [`read_checkpoint`], inside an open transaction.
pub async fn read_checkpoint_in(
    tx: &mut dyn SqlTransaction,
    key: &CheckpointKey,
) -> Result<Option<GlobalPosition>, SqlError> {
    let rows = tx.query(&select_checkpoint(key)).await?;
    decode_checkpoint(&rows)
}

/// Compare-and-swap the checkpoint from `expected_previous` to `new`.
///
/// `expected_previous = None` means "no row yet": the first write inserts, and
/// a concurrent first write is classified through the same re-read as an
/// update that matched nothing.
#[instrument(
    skip_all,
    fields(
        processor_id = %key.processor_id,
        new = %new,
        expected_previous = ?expected_previous.map(|p| p.value())
    ),
    err
)]
pub async fn store_checkpoint(
    tx: &mut dyn SqlTransaction,
    key: &CheckpointKey,
    new: GlobalPosition,
    expected_previous: Option<GlobalPosition>,
    instance_id: ProcessorInstanceId,
) -> Result<StoreCheckpointResult, SqlError> {
    let token = encode_checkpoint(new)?;

    let written = match expected_previous {
        Some(previous) => {
            tx.command(
                &Sql::new(
                    "update_checkpoint",
                    "UPDATE processors SET last_processed_checkpoint = $1, processor_instance_id = $2 \
                     WHERE processor_id = $3 AND partition = $4 AND version = $5 \
                     AND last_processed_checkpoint = $6",
                )
                .bind(token.as_str())
                .bind(instance_id.to_string())
                .bind(key.processor_id.as_str())
                .bind(key.partition.as_str())
                .bind(key.version)
                .bind(encode_checkpoint(previous)?),
            )
            .await?
        }
        None => {
            tx.command(
                &Sql::new(
                    "insert_checkpoint",
                    "INSERT INTO processors (processor_id, version, partition, last_processed_checkpoint, processor_instance_id) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (processor_id, partition, version) DO NOTHING",
                )
                .bind(key.processor_id.as_str())
                .bind(key.version)
                .bind(key.partition.as_str())
                .bind(token.as_str())
                .bind(instance_id.to_string()),
            )
            .await?
        }
    };

    if written.rows_affected > 0 {
        return Ok(StoreCheckpointResult::Applied);
    }

    let current = decode_checkpoint(&tx.query(&select_checkpoint(key)).await?)?;
    if current == Some(new) {
        debug!("checkpoint already stored by another writer");
        Ok(StoreCheckpointResult::IgnoredDuplicate)
    } else {
        warn!(current = ?current.map(|p| p.value()), "checkpoint moved underneath processor");
        Ok(StoreCheckpointResult::Conflict { current })
    }
}

/// Remove the checkpoint row (projection rebuild truncation).
#[instrument(skip_all, fields(processor_id = %key.processor_id), err)]
pub async fn delete_checkpoint(tx: &mut dyn SqlTransaction, key: &CheckpointKey) -> Result<u64, SqlError> {
    let result = tx
        .command(
            &Sql::new(
                "delete_checkpoint",
                "DELETE FROM processors WHERE processor_id = $1 AND partition = $2 AND version = $3",
            )
            .bind(key.processor_id.as_str())
            .bind(key.partition.as_str())
            .bind(key.version),
        )
        .await?;
    Ok(result.rows_affected)
}
