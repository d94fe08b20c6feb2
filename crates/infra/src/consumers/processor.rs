//! Checkpointed processors: reactors and projectors.
//!
//! Both variants share one envelope: every batch runs in a single
//! transaction, and after each message the processor's checkpoint is
//! compare-and-swapped to that message's global position in the same
//! transaction. A failed batch leaves no trace; a committed batch has moved
//! side effects and checkpoint together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument, warn};

use eventline_core::{
    DEFAULT_PARTITION, GlobalPosition, ProcessorInstanceId, ProcessorStartFrom, RecordedMessage,
    StartFrom,
};

use super::{ConsumerError, MessageHandler, MessageHandlerResult};
use crate::checkpoints::{self, CheckpointKey, StoreCheckpointResult};
use crate::event_store::EventStore;
use crate::projections::registry::{self, ProjectionType};
use crate::projections::{ProjectionDefinition, projection_processor_id};
use crate::sql::SqlExecutor;

/// Ends processing after the first message it returns `true` for.
pub type StopAfter = Arc<dyn Fn(&RecordedMessage) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ProcessorOptions {
    pub processor_id: String,
    pub version: u32,
    pub partition: String,
    pub start_from: ProcessorStartFrom,
    pub stop_after: Option<StopAfter>,
}

impl ProcessorOptions {
    pub fn new(processor_id: impl Into<String>) -> Self {
        Self {
            processor_id: processor_id.into(),
            version: 1,
            partition: DEFAULT_PARTITION.to_string(),
            start_from: ProcessorStartFrom::Current,
            stop_after: None,
        }
    }

    /// Options a projector uses unless told otherwise.
    pub fn for_projection(definition: &dyn ProjectionDefinition) -> Self {
        Self {
            version: definition.version(),
            ..Self::new(projection_processor_id(definition.name()))
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn start_from(mut self, start_from: ProcessorStartFrom) -> Self {
        self.start_from = start_from;
        self
    }

    pub fn stop_after<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RecordedMessage) -> bool + Send + Sync + 'static,
    {
        self.stop_after = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn checkpoint_key(&self) -> CheckpointKey {
        CheckpointKey::new(self.processor_id.as_str(), self.version, self.partition.as_str())
    }
}

impl std::fmt::Debug for ProcessorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorOptions")
            .field("processor_id", &self.processor_id)
            .field("version", &self.version)
            .field("partition", &self.partition)
            .field("start_from", &self.start_from)
            .field("stop_after", &self.stop_after.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub enum ProcessorKind {
    Reactor(Arc<dyn MessageHandler>),
    Projector(Arc<dyn ProjectionDefinition>),
}

impl ProcessorKind {
    fn label(&self) -> &'static str {
        match self {
            ProcessorKind::Reactor(_) => "reactor",
            ProcessorKind::Projector(_) => "projector",
        }
    }
}

/// Observes a registered processor from outside the consumer.
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    processor_id: String,
    instance_id: ProcessorInstanceId,
    is_active: Arc<AtomicBool>,
}

impl ProcessorHandle {
    pub fn id(&self) -> &str {
        &self.processor_id
    }

    pub fn instance_id(&self) -> ProcessorInstanceId {
        self.instance_id
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }
}

pub struct Processor {
    kind: ProcessorKind,
    options: ProcessorOptions,
    instance_id: ProcessorInstanceId,
    is_active: Arc<AtomicBool>,
    /// Last committed checkpoint; the expected value of the next CAS.
    checkpoint: Option<GlobalPosition>,
    /// Messages at or below this position were already handled.
    resume_after: GlobalPosition,
}

impl Processor {
    pub fn new(kind: ProcessorKind, options: ProcessorOptions) -> Self {
        Self {
            kind,
            options,
            instance_id: ProcessorInstanceId::new(),
            is_active: Arc::new(AtomicBool::new(true)),
            checkpoint: None,
            resume_after: GlobalPosition::ZERO,
        }
    }

    pub fn reactor(options: ProcessorOptions, handler: Arc<dyn MessageHandler>) -> Self {
        Self::new(ProcessorKind::Reactor(handler), options)
    }

    pub fn projector(definition: Arc<dyn ProjectionDefinition>) -> Self {
        let options = ProcessorOptions::for_projection(definition.as_ref());
        Self::new(ProcessorKind::Projector(definition), options)
    }

    pub fn projector_with_options(
        definition: Arc<dyn ProjectionDefinition>,
        options: ProcessorOptions,
    ) -> Self {
        Self::new(ProcessorKind::Projector(definition), options)
    }

    pub fn id(&self) -> &str {
        &self.options.processor_id
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    pub(crate) fn set_partition(&mut self, partition: &str) {
        self.options.partition = partition.to_string();
    }

    pub fn instance_id(&self) -> ProcessorInstanceId {
        self.instance_id
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle {
            processor_id: self.options.processor_id.clone(),
            instance_id: self.instance_id,
            is_active: self.is_active.clone(),
        }
    }

    fn deactivate(&self) {
        self.is_active.store(false, Ordering::Release);
    }

    fn handler_error(&self, source: anyhow::Error) -> ConsumerError {
        ConsumerError::Handler {
            processor_id: self.options.processor_id.clone(),
            source,
        }
    }

    /// Resolve where this processor resumes and mark it active.
    ///
    /// The stored checkpoint is always read: it is the expected value for the
    /// first checkpoint write, whatever `start_from` says.
    #[instrument(skip_all, fields(processor_id = %self.options.processor_id, kind = self.kind.label()), err)]
    pub async fn start(
        &mut self,
        store: &dyn EventStore,
        executor: &dyn SqlExecutor,
    ) -> Result<StartFrom, ConsumerError> {
        let key = self.options.checkpoint_key();
        let stored = checkpoints::read_checkpoint(executor, &key).await?;

        let start = match self.options.start_from {
            ProcessorStartFrom::Beginning => StartFrom::Beginning,
            ProcessorStartFrom::Position(position) => StartFrom::Position(position),
            ProcessorStartFrom::Current => stored.map(StartFrom::Position).unwrap_or(StartFrom::Beginning),
            ProcessorStartFrom::End => StartFrom::Position(
                store
                    .read_last_global_position(&self.options.partition)
                    .await?
                    .unwrap_or(GlobalPosition::ZERO),
            ),
        };

        if let ProcessorKind::Projector(definition) = &self.kind {
            let mut tx = executor.begin().await?;
            definition
                .init(tx.as_mut())
                .await
                .map_err(|e| self.handler_error(e))?;
            registry::register_projection(
                tx.as_mut(),
                definition.as_ref(),
                &self.options.partition,
                ProjectionType::Async,
            )
            .await?;
            tx.commit().await?;
        }

        self.checkpoint = stored;
        self.resume_after = start.resolve(None);
        self.is_active.store(true, Ordering::Release);

        info!(
            resume_after = %self.resume_after,
            stored_checkpoint = ?stored.map(|p| p.value()),
            instance_id = %self.instance_id,
            "processor started"
        );
        Ok(start)
    }

    /// Process one batch in one transaction.
    ///
    /// Returns `Stop` once the processor has deactivated itself. Any error
    /// rolls back the whole batch; only a checkpoint conflict deactivates.
    #[instrument(skip_all, fields(processor_id = %self.options.processor_id, batch_len = messages.len()), err)]
    pub async fn handle_batch(
        &mut self,
        messages: &[RecordedMessage],
        executor: &dyn SqlExecutor,
    ) -> Result<MessageHandlerResult, ConsumerError> {
        if !self.is_active() {
            return Ok(MessageHandlerResult::Stop);
        }

        let pending: Vec<&RecordedMessage> = messages
            .iter()
            .filter(|m| m.global_position > self.resume_after)
            .collect();
        if pending.is_empty() {
            return Ok(MessageHandlerResult::Ack);
        }

        let key = self.options.checkpoint_key();
        let mut tx = executor.begin().await?;
        let mut checkpoint = self.checkpoint;
        let mut outcome = MessageHandlerResult::Ack;

        for message in pending {
            let result = match &self.kind {
                ProcessorKind::Reactor(handler) => handler
                    .handle(message, tx.as_mut())
                    .await
                    .map_err(|e| self.handler_error(e))?,
                ProcessorKind::Projector(definition) => {
                    if definition.handles(&message.message_type) {
                        definition
                            .handle(std::slice::from_ref(message), tx.as_mut())
                            .await
                            .map_err(|e| self.handler_error(e))?;
                    }
                    MessageHandlerResult::Ack
                }
            };

            match checkpoints::store_checkpoint(
                tx.as_mut(),
                &key,
                message.global_position,
                checkpoint,
                self.instance_id,
            )
            .await?
            {
                StoreCheckpointResult::Applied | StoreCheckpointResult::IgnoredDuplicate => {
                    checkpoint = Some(message.global_position);
                }
                StoreCheckpointResult::Conflict { current } => {
                    warn!(
                        position = %message.global_position,
                        current = ?current.map(|p| p.value()),
                        "checkpoint conflict, deactivating processor"
                    );
                    self.deactivate();
                    return Err(ConsumerError::CheckpointConflict {
                        processor_id: self.options.processor_id.clone(),
                        current,
                    });
                }
            }

            let stop_after = self
                .options
                .stop_after
                .as_ref()
                .is_some_and(|predicate| predicate(message));
            if result == MessageHandlerResult::Stop || stop_after {
                debug!(position = %message.global_position, "processor finished");
                self.deactivate();
                outcome = MessageHandlerResult::Stop;
                break;
            }
        }

        tx.commit().await?;

        self.checkpoint = checkpoint;
        if let Some(position) = checkpoint {
            self.resume_after = position;
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("kind", &self.kind.label())
            .field("options", &self.options)
            .field("instance_id", &self.instance_id)
            .field("is_active", &self.is_active())
            .field("checkpoint", &self.checkpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use eventline_core::Message;
    use serde_json::json;

    use crate::event_store::{AppendOptions, EventLog, MessageBatch};
    use crate::sql::schema::create_schema;
    use crate::sql::{SqlTransaction, SqliteExecutor};

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<u64>>,
        fail_on: Option<u64>,
    }

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(
            &self,
            message: &RecordedMessage,
            _tx: &mut dyn SqlTransaction,
        ) -> anyhow::Result<MessageHandlerResult> {
            let position = message.global_position.value();
            if self.fail_on == Some(position) {
                anyhow::bail!("refusing message {position}");
            }
            self.seen.lock().unwrap().push(position);
            Ok(MessageHandlerResult::Ack)
        }
    }

    async fn setup(count: usize) -> (EventLog, Arc<SqliteExecutor>) {
        let executor = Arc::new(SqliteExecutor::in_memory().await.unwrap());
        create_schema(executor.as_ref()).await.unwrap();
        let log = EventLog::new(executor.clone());
        for _ in 0..count {
            log.append_to_stream(
                "room-1",
                "room",
                vec![Message::new("RoomBooked", json!({}))],
                AppendOptions::default(),
            )
            .await
            .unwrap();
        }
        (log, executor)
    }

    async fn all(log: &EventLog) -> MessageBatch {
        log.read_messages_batch(GlobalPosition::ZERO, 100, DEFAULT_PARTITION)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn checkpoint_advances_with_each_batch_and_resumes() {
        let (log, executor) = setup(3).await;
        let handler = Arc::new(Collect::default());
        let mut processor = Processor::reactor(ProcessorOptions::new("audit"), handler.clone());

        assert_eq!(processor.start(&log, executor.as_ref()).await.unwrap(), StartFrom::Beginning);
        let batch = all(&log).await;
        processor.handle_batch(&batch.messages, executor.as_ref()).await.unwrap();
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2, 3]);

        // A fresh instance resumes after the stored checkpoint.
        let mut restarted = Processor::reactor(ProcessorOptions::new("audit"), handler.clone());
        assert_eq!(
            restarted.start(&log, executor.as_ref()).await.unwrap(),
            StartFrom::Position(GlobalPosition::new(3))
        );
        restarted.handle_batch(&batch.messages, executor.as_ref()).await.unwrap();
        assert_eq!(handler.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_the_batch_but_stays_active() {
        let (log, executor) = setup(3).await;
        let handler = Arc::new(Collect {
            fail_on: Some(2),
            ..Collect::default()
        });
        let mut processor = Processor::reactor(ProcessorOptions::new("audit"), handler);
        processor.start(&log, executor.as_ref()).await.unwrap();

        let batch = all(&log).await;
        let err = processor
            .handle_batch(&batch.messages, executor.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Handler { ref processor_id, .. } if processor_id == "audit"));
        assert!(processor.is_active());

        let key = CheckpointKey::new("audit", 1, DEFAULT_PARTITION);
        assert_eq!(checkpoints::read_checkpoint(executor.as_ref(), &key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stop_after_deactivates_and_checkpoints_the_last_message() {
        let (log, executor) = setup(4).await;
        let handler = Arc::new(Collect::default());
        let options = ProcessorOptions::new("first-two").stop_after(|m| m.global_position.value() == 2);
        let mut processor = Processor::reactor(options, handler.clone());
        let handle = processor.handle();
        processor.start(&log, executor.as_ref()).await.unwrap();

        let batch = all(&log).await;
        let result = processor.handle_batch(&batch.messages, executor.as_ref()).await.unwrap();

        assert_eq!(result, MessageHandlerResult::Stop);
        assert!(!handle.is_active());
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2]);
        let key = CheckpointKey::new("first-two", 1, DEFAULT_PARTITION);
        assert_eq!(
            checkpoints::read_checkpoint(executor.as_ref(), &key).await.unwrap(),
            Some(GlobalPosition::new(2))
        );
    }

    #[tokio::test]
    async fn concurrent_writer_conflict_is_fatal() {
        let (log, executor) = setup(2).await;
        let mut processor = Processor::reactor(ProcessorOptions::new("audit"), Arc::new(Collect::default()));
        processor.start(&log, executor.as_ref()).await.unwrap();

        // Another instance moves the checkpoint after this one started.
        let key = CheckpointKey::new("audit", 1, DEFAULT_PARTITION);
        let mut tx = executor.begin().await.unwrap();
        checkpoints::store_checkpoint(
            tx.as_mut(),
            &key,
            GlobalPosition::new(2),
            None,
            ProcessorInstanceId::new(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let batch = all(&log).await;
        let err = processor
            .handle_batch(&batch.messages, executor.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::CheckpointConflict { .. }));
        assert!(!processor.is_active());
    }

    #[tokio::test]
    async fn end_resolves_to_the_current_tail() {
        let (log, executor) = setup(2).await;
        let options = ProcessorOptions::new("live").start_from(ProcessorStartFrom::End);
        let handler = Arc::new(Collect::default());
        let mut processor = Processor::reactor(options, handler.clone());

        assert_eq!(
            processor.start(&log, executor.as_ref()).await.unwrap(),
            StartFrom::Position(GlobalPosition::new(2))
        );
        let batch = all(&log).await;
        processor.handle_batch(&batch.messages, executor.as_ref()).await.unwrap();
        assert!(handler.seen.lock().unwrap().is_empty());
    }
}
