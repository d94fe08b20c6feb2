//! Log consumption: a polling puller fanning batches out to checkpointed
//! processors.
//!
//! ```text
//! EventLog ──read_messages_batch──▶ MessageBatchPuller ──batch──▶ Consumer
//!                                                                  │
//!                                          ┌───────────────────────┼──────────────┐
//!                                          ▼                       ▼              ▼
//!                                   Processor (reactor)   Processor (projector)  ...
//!                                   handler + checkpoint  projection + checkpoint
//!                                   in one transaction    in one transaction
//! ```
//!
//! Delivery is at-least-once: a processor that crashes mid-batch replays the
//! batch from its last committed checkpoint.

pub mod consumer;
pub mod processor;
pub mod puller;

use async_trait::async_trait;
use thiserror::Error;

use eventline_core::{GlobalPosition, RecordedMessage};

use crate::event_store::{EventStoreError, MessageBatch};
use crate::sql::{SqlError, SqlTransaction};

pub use consumer::{Consumer, ConsumerOptions};
pub use processor::{Processor, ProcessorHandle, ProcessorKind, ProcessorOptions, StopAfter};
pub use puller::{MessageBatchPuller, PullerOptions};

/// What a handler asks the processing loop to do next.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum MessageHandlerResult {
    /// Processed; keep going.
    #[default]
    Ack,
    /// Deliberately ignored; keep going.
    Skip,
    /// Stop after this message.
    Stop,
}

/// Reactor logic for one message.
///
/// `tx` is the batch transaction the processor's checkpoint is written in, so
/// side effects written through it commit atomically with the checkpoint.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &RecordedMessage,
        tx: &mut dyn SqlTransaction,
    ) -> anyhow::Result<MessageHandlerResult>;
}

/// Receives every batch a puller reads.
#[async_trait]
pub trait MessageBatchHandler: Send + Sync {
    async fn handle(&self, batch: &MessageBatch) -> Result<MessageHandlerResult, ConsumerError>;
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid consumer configuration: {0}")]
    Configuration(String),

    #[error("message batch puller is already running")]
    AlreadyRunning,

    #[error("checkpoint conflict for processor '{processor_id}': stored position is {current:?}")]
    CheckpointConflict {
        processor_id: String,
        current: Option<GlobalPosition>,
    },

    #[error("processor '{processor_id}' failed: {source:#}")]
    Handler {
        processor_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error("processor task failed: {0}")]
    ProcessorTask(String),
}
