//! Projection rebuilds: truncate and replay one projection under an advisory
//! lock, resuming from the checkpoint after a crash.
//!
//! ```text
//! acquire lock ──▶ status?
//!                   ├─ async_processing ──────────────────────────────┐ (resume)
//!                   └─ otherwise: status := async_processing          │
//!                                 + truncate + delete checkpoint ─────┤ (fresh)
//!                                                                     ▼
//!          drain through a projector (start: Current) up to the tail seen now
//!                                                                     │
//!          one transaction: status := active, then replay what is left│
//!                                                                     │
//!                          error: status stays async_processing ◀─────┘
//! release lock (always)
//! ```
//!
//! Inline appends read the status row with a share lock (Postgres) or behind
//! the single SQLite writer. Both status flips are the first statement of
//! their transaction, so each one waits for inline appends that read the
//! previous status. An append that skipped the projection has committed before
//! the closing transaction reads the log, and an append that reads the new
//! status applies inline and is not visible to that transaction.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use eventline_core::{DEFAULT_PARTITION, GlobalPosition, ProcessorInstanceId, ProcessorStartFrom, RecordedMessage};

use super::lock::{AdvisoryLock, LockKey, acquire_with_retry, Acquisition};
use super::registry::{self, ProjectionStatus, ProjectionType};
use super::ProjectionDefinition;
use crate::checkpoints::{self, CheckpointKey, StoreCheckpointResult};
use crate::consumers::{Consumer, ConsumerError, ConsumerOptions, Processor, ProcessorOptions};
use crate::event_store::{EventLog, EventStore, EventStoreError};
use crate::retry::RetryPolicy;
use crate::sql::{SqlError, SqlTransaction};

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("could not acquire the rebuild lock after {attempts} attempts")]
    LockNotAcquired { attempts: u32 },

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error("projection '{name}' failed: {source:#}")]
    Projection {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RebuildMode {
    /// State was truncated and replayed from the beginning.
    Fresh,
    /// An interrupted rebuild was continued from its checkpoint.
    Resumed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RebuildOutcome {
    pub mode: RebuildMode,
    /// Last position the projection processed, if any.
    pub checkpoint: Option<GlobalPosition>,
}

pub struct ProjectionRebuilder {
    log: EventLog,
    definition: Arc<dyn ProjectionDefinition>,
    lock: Arc<dyn AdvisoryLock>,
    retry: RetryPolicy,
    partition: String,
    batch_size: usize,
}

impl ProjectionRebuilder {
    pub fn new(
        log: EventLog,
        definition: Arc<dyn ProjectionDefinition>,
        lock: Arc<dyn AdvisoryLock>,
    ) -> Self {
        Self {
            log,
            definition,
            lock,
            retry: RetryPolicy::default(),
            partition: DEFAULT_PARTITION.to_string(),
            batch_size: ConsumerOptions::default().batch_size,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::for_projection(self.definition.name(), &self.partition, self.definition.version())
    }

    fn checkpoint_key(&self) -> CheckpointKey {
        self.processor_options().checkpoint_key()
    }

    fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions::for_projection(self.definition.as_ref())
            .partition(self.partition.as_str())
            .start_from(ProcessorStartFrom::Current)
    }

    /// Rebuild the projection, or resume an interrupted rebuild.
    #[instrument(
        skip(self),
        fields(projection = self.definition.name(), version = self.definition.version(), partition = %self.partition),
        err
    )]
    pub async fn rebuild(&self) -> Result<RebuildOutcome, RebuildError> {
        let guard = match acquire_with_retry(self.lock.as_ref(), self.lock_key(), &self.retry).await? {
            Acquisition::Acquired(guard) => guard,
            Acquisition::Exhausted { attempts } => {
                return Err(RebuildError::LockNotAcquired { attempts });
            }
        };

        let result = self.rebuild_locked().await;

        if let Err(err) = guard.release().await {
            warn!(error = %err, "failed to release rebuild lock");
        }
        result
    }

    fn projection_error(&self, source: anyhow::Error) -> RebuildError {
        RebuildError::Projection {
            name: self.definition.name().to_string(),
            source,
        }
    }

    async fn rebuild_locked(&self) -> Result<RebuildOutcome, RebuildError> {
        let executor = self.log.executor();
        let name = self.definition.name();
        let version = self.definition.version();

        let registration = registry::read_projection(executor.as_ref(), name, &self.partition, version).await?;
        let mode = match registration.as_ref().map(|r| r.status) {
            Some(ProjectionStatus::AsyncProcessing) => RebuildMode::Resumed,
            _ => RebuildMode::Fresh,
        };

        if mode == RebuildMode::Fresh {
            let mut tx = executor.begin().await?;
            if registration.is_none() {
                registry::register_projection(
                    tx.as_mut(),
                    self.definition.as_ref(),
                    &self.partition,
                    ProjectionType::Async,
                )
                .await?;
            }
            registry::set_projection_status(
                tx.as_mut(),
                name,
                &self.partition,
                version,
                ProjectionStatus::AsyncProcessing,
            )
            .await?;
            self.definition
                .init(tx.as_mut())
                .await
                .map_err(|e| self.projection_error(e))?;
            self.definition
                .truncate(tx.as_mut())
                .await
                .map_err(|e| self.projection_error(e))?;
            checkpoints::delete_checkpoint(tx.as_mut(), &self.checkpoint_key()).await?;
            tx.commit().await?;
            info!("projection truncated for rebuild");
        } else {
            info!("resuming interrupted rebuild");
        }

        if let Some(target) = self.log.read_last_global_position(&self.partition).await? {
            self.drain_to(target).await?;
        }

        let checkpoint = self.finish().await?;
        info!(?mode, checkpoint = ?checkpoint.map(|p| p.value()), "projection rebuilt");
        Ok(RebuildOutcome { mode, checkpoint })
    }

    /// Replay through a regular projector until `target` has been processed
    /// or the log runs dry.
    async fn drain_to(&self, target: GlobalPosition) -> Result<(), RebuildError> {
        let consumer = Consumer::for_log(
            &self.log,
            ConsumerOptions::default()
                .partition(self.partition.as_str())
                .batch_size(self.batch_size)
                .stop_when_no_messages_left(true),
        );
        consumer.register(Processor::projector_with_options(
            self.definition.clone(),
            self.processor_options()
                .stop_after(move |message| message.global_position >= target),
        ));
        consumer.start().await?;
        Ok(())
    }

    /// Flip the status back to `active` and, in the same transaction, replay
    /// everything after the checkpoint.
    async fn finish(&self) -> Result<Option<GlobalPosition>, RebuildError> {
        let executor = self.log.executor();
        let key = self.checkpoint_key();
        let mut tx = executor.begin().await?;

        registry::set_projection_status(
            tx.as_mut(),
            self.definition.name(),
            &self.partition,
            self.definition.version(),
            ProjectionStatus::Active,
        )
        .await?;

        let mut checkpoint = checkpoints::read_checkpoint_in(tx.as_mut(), &key).await?;
        let instance_id = ProcessorInstanceId::new();
        loop {
            let batch = self
                .log
                .read_messages_batch_in(
                    tx.as_mut(),
                    checkpoint.unwrap_or(GlobalPosition::ZERO),
                    self.batch_size.max(1),
                    &self.partition,
                )
                .await?;
            let Some(last) = batch.last_position else {
                break;
            };
            debug!(messages = batch.len(), last = %last, "catching up after drain");
            self.apply(batch.messages, tx.as_mut()).await?;

            match checkpoints::store_checkpoint(tx.as_mut(), &key, last, checkpoint, instance_id).await? {
                StoreCheckpointResult::Applied | StoreCheckpointResult::IgnoredDuplicate => {
                    checkpoint = Some(last);
                }
                StoreCheckpointResult::Conflict { current } => {
                    return Err(ConsumerError::CheckpointConflict {
                        processor_id: key.processor_id.clone(),
                        current,
                    }
                    .into());
                }
            }
        }

        tx.commit().await?;
        Ok(checkpoint)
    }

    async fn apply(
        &self,
        messages: Vec<RecordedMessage>,
        tx: &mut dyn SqlTransaction,
    ) -> Result<(), RebuildError> {
        let relevant: Vec<RecordedMessage> = messages
            .into_iter()
            .filter(|m| self.definition.handles(&m.message_type))
            .collect();
        if relevant.is_empty() {
            return Ok(());
        }
        self.definition
            .handle(&relevant, tx)
            .await
            .map_err(|e| self.projection_error(e))
    }
}

impl std::fmt::Debug for ProjectionRebuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionRebuilder")
            .field("projection", &self.definition.name())
            .field("partition", &self.partition)
            .field("retry", &self.retry)
            .finish()
    }
}
