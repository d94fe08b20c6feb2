//! SQL-backed event log.
//!
//! ## Append protocol
//!
//! One transaction per append:
//!
//! 1. Read the stream row and check the `ExpectedVersion` sentinel.
//! 2. Conditional upsert of the stream row: insert at `n`, or move
//!    `stream_position` forward by `n` only while it still equals the expected
//!    version. `RETURNING stream_position` must equal `expected + n`, otherwise
//!    another writer got there first.
//! 3. Insert the messages at `expected + 1 ..= expected + n`; the storage engine
//!    assigns `global_position`.
//! 4. Run pre-commit hooks with the same transaction, then commit.
//!
//! Step 2 is what serializes concurrent writers; the unique constraint on
//! `(stream_id, stream_position, partition, is_archived)` is a backstop.
//!
//! ## Commit order
//!
//! Readers advance a cursor past the highest position they have seen, so a
//! partition's positions must become visible in increasing order. SQLite has a
//! single writer. On Postgres a sequence value is handed out at insert time,
//! so step 3 first takes the partition's transaction-scoped advisory lock
//! (`pg_advisory_xact_lock`), held until commit or rollback: a later writer
//! can only draw a position once every earlier one has finished.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use eventline_core::{GlobalPosition, Message, MessageId, MessageKind, RecordedMessage, VersionConflict};

use super::types::{
    AggregateStreamOptions, AggregateStreamResult, AppendFailure, AppendOptions, AppendResult,
    AppendSuccess, EventStore, EventStoreError, MessageBatch, PreCommitHook, ReadStreamOptions,
    ReadStreamResult, Upcaster,
};
use crate::projections::LockKey;
use crate::sql::{Dialect, Sql, SqlExecutor, SqlRow, SqlTransaction, SqlValue};

const MESSAGE_COLUMNS: &str = "global_position, stream_id, stream_position, partition, message_kind, \
     message_data, message_metadata, message_schema_version, message_type, message_id, created_at";

/// Append-only message log over a [`SqlExecutor`].
#[derive(Clone)]
pub struct EventLog {
    executor: Arc<dyn SqlExecutor>,
    upcaster: Option<Arc<dyn Upcaster>>,
    hooks: Vec<Arc<dyn PreCommitHook>>,
}

impl EventLog {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self {
            executor,
            upcaster: None,
            hooks: Vec::new(),
        }
    }

    pub fn with_upcaster(mut self, upcaster: Arc<dyn Upcaster>) -> Self {
        self.upcaster = Some(upcaster);
        self
    }

    /// Hook run on every append, before any per-call hooks.
    pub fn with_pre_commit_hook(mut self, hook: Arc<dyn PreCommitHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn executor(&self) -> &Arc<dyn SqlExecutor> {
        &self.executor
    }

    fn upcast(&self, message: RecordedMessage) -> RecordedMessage {
        match &self.upcaster {
            Some(upcaster) => upcaster.upcast(message),
            None => message,
        }
    }

    /// Read the stream and fold it into a state.
    ///
    /// `expected_version` is re-checked against the freshly read version before
    /// folding, so a stale caller gets a concurrency error rather than state.
    #[instrument(skip(self, initial, evolve, options), fields(stream_name = %stream_name), err)]
    pub async fn aggregate_stream<S, E, F>(
        &self,
        stream_name: &str,
        initial: S,
        mut evolve: F,
        options: AggregateStreamOptions,
    ) -> Result<AggregateStreamResult<S>, EventStoreError>
    where
        E: DeserializeOwned,
        F: FnMut(S, E) -> S,
    {
        let read = self.read_stream(stream_name, options.read).await?;

        options
            .expected_version
            .check(read.current_stream_version, read.stream_exists)?;

        let mut state = initial;
        for message in &read.messages {
            let event: E = message.decode()?;
            state = evolve(state, event);
        }

        Ok(AggregateStreamResult {
            state,
            current_stream_version: read.current_stream_version,
            stream_exists: read.stream_exists,
        })
    }

    /// [`EventStore::read_messages_batch`] inside an open transaction.
    pub(crate) async fn read_messages_batch_in(
        &self,
        tx: &mut dyn SqlTransaction,
        after: GlobalPosition,
        batch_size: usize,
        partition: &str,
    ) -> Result<MessageBatch, EventStoreError> {
        let rows = tx.query(&select_batch(after, batch_size, partition)).await?;
        self.decode_batch(&rows)
    }

    fn decode_batch(&self, rows: &[SqlRow]) -> Result<MessageBatch, EventStoreError> {
        let messages = rows
            .iter()
            .map(|row| decode_message(row).map(|m| self.upcast(m)))
            .collect::<Result<Vec<_>, _>>()?;
        let last_position = messages.last().map(|m| m.global_position);
        Ok(MessageBatch {
            messages,
            last_position,
        })
    }

    async fn read_stream_in(
        &self,
        tx: &mut dyn SqlTransaction,
        stream_name: &str,
        options: &ReadStreamOptions,
    ) -> Result<ReadStreamResult, EventStoreError> {
        let partition = options.partition.as_str();
        let stream = tx
            .query(
                &Sql::new(
                    "read_stream_position",
                    "SELECT stream_position FROM streams \
                     WHERE stream_id = $1 AND partition = $2 AND is_archived = FALSE",
                )
                .bind(stream_name)
                .bind(partition),
            )
            .await?;

        let Some(row) = stream.first() else {
            return Ok(ReadStreamResult {
                messages: Vec::new(),
                current_stream_version: 0,
                stream_exists: false,
            });
        };
        let current_stream_version = row.try_u64("stream_position")?;

        let from = options.from.unwrap_or(1).max(1);
        let upper = options
            .upper_bound()
            .map_or(current_stream_version, |upper| upper.min(current_stream_version));

        let rows = tx
            .query(
                &Sql::new(
                    "read_stream",
                    format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages \
                         WHERE stream_id = $1 AND partition = $2 AND is_archived = FALSE \
                         AND stream_position >= $3 AND stream_position <= $4 \
                         ORDER BY stream_position ASC"
                    ),
                )
                .bind(stream_name)
                .bind(partition)
                .bind(from)
                .bind(upper),
            )
            .await?;
        let messages = rows
            .iter()
            .map(|row| decode_message(row).map(|m| self.upcast(m)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ReadStreamResult {
            messages,
            current_stream_version,
            stream_exists: true,
        })
    }

    async fn append_in_transaction(
        &self,
        tx: &mut dyn SqlTransaction,
        stream_name: &str,
        stream_type: &str,
        messages: Vec<Message>,
        options: &AppendOptions,
    ) -> Result<AppendResult, EventStoreError> {
        let partition = options.partition.as_str();
        let count = messages.len() as u64;

        let existing = tx
            .query(
                &Sql::new(
                    "read_stream_position",
                    "SELECT stream_position FROM streams \
                     WHERE stream_id = $1 AND partition = $2 AND is_archived = FALSE",
                )
                .bind(stream_name)
                .bind(partition),
            )
            .await?;
        let stream_exists = !existing.is_empty();
        let current = match existing.first() {
            Some(row) => row.try_u64("stream_position")?,
            None => 0,
        };

        if let Err(conflict) = options.expected_version.check(current, stream_exists) {
            return Ok(AppendResult::Failure(AppendFailure::VersionMismatch(conflict)));
        }
        let expected = options.expected_version.resolve(current);

        let upserted = tx
            .query(
                &Sql::new(
                    "upsert_stream",
                    "INSERT INTO streams (stream_id, stream_position, partition, stream_type, stream_metadata, is_archived) \
                     VALUES ($1, $2, $3, $4, $5, FALSE) \
                     ON CONFLICT (stream_id, partition, is_archived) \
                     DO UPDATE SET stream_position = streams.stream_position + $2 \
                     WHERE streams.stream_position = $6 \
                     RETURNING stream_position",
                )
                .bind(stream_name)
                .bind(count)
                .bind(partition)
                .bind(stream_type)
                .bind("{}")
                .bind(expected),
            )
            .await?;

        let next = match upserted.first() {
            Some(row) => Some(row.try_u64("stream_position")?),
            None => None,
        };
        if next != Some(expected + count) {
            debug!(stream_name, expected, ?next, "stream moved under a concurrent append");
            return Ok(AppendResult::Failure(AppendFailure::VersionMismatch(
                VersionConflict {
                    expected: options.expected_version,
                    actual: next.map(|n| n.saturating_sub(count)).unwrap_or(current),
                    stream_exists,
                },
            )));
        }

        if tx.dialect() == Dialect::Postgres {
            tx.command(
                &Sql::new("lock_partition_appends", "SELECT pg_advisory_xact_lock($1)")
                    .bind(LockKey::for_appends(partition).value()),
            )
            .await?;
        }

        // Stored with microsecond precision; keep the in-memory copy identical.
        let created_at = Utc::now().trunc_subsecs(6);
        let created_at_text = created_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut recorded = Vec::with_capacity(messages.len());

        for (offset, message) in messages.into_iter().enumerate() {
            let stream_position = expected + offset as u64 + 1;
            let data = serde_json::to_string(&message.data)
                .map_err(|e| EventStoreError::Serialization(e.to_string()))?;
            let metadata = serde_json::to_string(&message.metadata)
                .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

            let rows = tx
                .query(
                    &Sql::new(
                        "insert_message",
                        "INSERT INTO messages (stream_id, stream_position, partition, message_kind, message_data, \
                         message_metadata, message_schema_version, message_type, message_id, is_archived, created_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10) \
                         RETURNING global_position",
                    )
                    .bind(stream_name)
                    .bind(stream_position)
                    .bind(partition)
                    .bind(message.kind.code())
                    .bind(data)
                    .bind(metadata)
                    .bind(message.schema_version.to_string())
                    .bind(message.message_type.as_str())
                    .bind(message.message_id.to_string())
                    .bind(created_at_text.as_str()),
                )
                .await?;

            let global_position = rows
                .first()
                .ok_or_else(|| {
                    EventStoreError::InvalidAppend("message insert returned no global position".to_string())
                })?
                .try_u64("global_position")?;

            recorded.push(RecordedMessage {
                message_id: message.message_id,
                kind: message.kind,
                message_type: message.message_type,
                data: message.data,
                metadata: message.metadata,
                schema_version: message.schema_version,
                stream_name: stream_name.to_string(),
                stream_position,
                partition: partition.to_string(),
                global_position: GlobalPosition::new(global_position),
                created_at,
            });
        }

        for hook in self.hooks.iter().chain(options.before_commit.iter()) {
            hook.before_commit(&recorded, &mut *tx)
                .await
                .map_err(|source| EventStoreError::PreCommit { source })?;
        }

        let last_global_position = recorded
            .last()
            .map(|m| m.global_position)
            .unwrap_or(GlobalPosition::ZERO);

        Ok(AppendResult::Success(AppendSuccess {
            next_expected_stream_version: expected + count,
            last_global_position,
            created_new_stream: !stream_exists,
        }))
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("dialect", &self.executor.dialect())
            .field("upcaster", &self.upcaster.is_some())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl EventStore for EventLog {
    #[instrument(
        skip(self, messages, options),
        fields(
            stream_name = %stream_name,
            partition = %options.partition,
            message_count = messages.len(),
            expected_version = %options.expected_version
        ),
        err
    )]
    async fn append_to_stream(
        &self,
        stream_name: &str,
        stream_type: &str,
        messages: Vec<Message>,
        options: AppendOptions,
    ) -> Result<AppendResult, EventStoreError> {
        if messages.is_empty() {
            return Ok(AppendResult::Failure(AppendFailure::EmptyBatch));
        }

        let mut tx = self.executor.begin().await?;
        let result = self
            .append_in_transaction(tx.as_mut(), stream_name, stream_type, messages, &options)
            .await;

        match result {
            Ok(AppendResult::Success(success)) => {
                tx.commit().await?;
                debug!(
                    next_expected_stream_version = success.next_expected_stream_version,
                    last_global_position = %success.last_global_position,
                    "append committed"
                );
                Ok(AppendResult::Success(success))
            }
            Ok(failure) => {
                tx.rollback().await?;
                warn!(?failure, "append rejected");
                Ok(failure)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed append failed");
                }
                Err(err)
            }
        }
    }

    /// The version and the rows are read in one transaction, and rows are
    /// bounded by that version, so a concurrent append never shows up as
    /// messages past `current_stream_version`.
    #[instrument(skip(self, options), fields(stream_name = %stream_name, partition = %options.partition), err)]
    async fn read_stream(
        &self,
        stream_name: &str,
        options: ReadStreamOptions,
    ) -> Result<ReadStreamResult, EventStoreError> {
        let mut tx = self.executor.begin().await?;
        let result = self.read_stream_in(tx.as_mut(), stream_name, &options).await?;
        tx.commit().await?;
        Ok(result)
    }

    #[instrument(skip(self), fields(after = %after), err)]
    async fn read_messages_batch(
        &self,
        after: GlobalPosition,
        batch_size: usize,
        partition: &str,
    ) -> Result<MessageBatch, EventStoreError> {
        let rows = self
            .executor
            .query(&select_batch(after, batch_size, partition))
            .await?;
        self.decode_batch(&rows)
    }

    #[instrument(skip(self), err)]
    async fn read_last_global_position(
        &self,
        partition: &str,
    ) -> Result<Option<GlobalPosition>, EventStoreError> {
        let rows = self
            .executor
            .query(
                &Sql::new(
                    "read_last_global_position",
                    "SELECT MAX(global_position) AS global_position FROM messages \
                     WHERE partition = $1 AND is_archived = FALSE",
                )
                .bind(partition),
            )
            .await?;

        match rows.first() {
            Some(row) if !matches!(row.get("global_position"), None | Some(SqlValue::Null)) => {
                Ok(Some(GlobalPosition::new(row.try_u64("global_position")?)))
            }
            _ => Ok(None),
        }
    }
}

fn select_batch(after: GlobalPosition, batch_size: usize, partition: &str) -> Sql {
    Sql::new(
        "read_messages_batch",
        format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE partition = $1 AND is_archived = FALSE AND global_position > $2 \
             ORDER BY global_position ASC LIMIT $3"
        ),
    )
    .bind(partition)
    .bind(after.value())
    .bind(batch_size as u64)
}

fn decode_message(row: &SqlRow) -> Result<RecordedMessage, EventStoreError> {
    let data = serde_json::from_str(&row.try_string("message_data")?)
        .map_err(|e| EventStoreError::Serialization(format!("message_data: {e}")))?;
    let metadata = serde_json::from_str(&row.try_string("message_metadata")?)
        .map_err(|e| EventStoreError::Serialization(format!("message_metadata: {e}")))?;
    let schema_version = row
        .try_string("message_schema_version")?
        .parse::<u32>()
        .map_err(|e| EventStoreError::Serialization(format!("message_schema_version: {e}")))?;
    let message_id: MessageId = row.try_string("message_id")?.parse()?;
    let created_at = DateTime::parse_from_rfc3339(&row.try_string("created_at")?)
        .map_err(|e| EventStoreError::Serialization(format!("created_at: {e}")))?
        .with_timezone(&Utc);

    Ok(RecordedMessage {
        message_id,
        kind: MessageKind::from_code(&row.try_string("message_kind")?)?,
        message_type: row.try_string("message_type")?,
        data,
        metadata,
        schema_version,
        stream_name: row.try_string("stream_id")?,
        stream_position: row.try_u64("stream_position")?,
        partition: row.try_string("partition")?,
        global_position: GlobalPosition::new(row.try_u64("global_position")?),
        created_at,
    })
}
