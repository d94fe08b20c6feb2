//! Projections (read model builders).
//!
//! A projection turns messages into query-optimized state. The same
//! definition can run:
//! - **Inline**: inside the append transaction, via [`InlineProjections`]
//! - **Async**: behind a projector processor, checkpointed like any other
//!
//! All projections are:
//! - **Rebuildable**: `truncate` plus a replay reconstructs them
//! - **Idempotent**: safe under at-least-once delivery

pub mod inline;
pub mod lock;
pub mod rebuild;
pub mod registry;

use async_trait::async_trait;

use eventline_core::RecordedMessage;

use crate::sql::SqlTransaction;

pub use inline::InlineProjections;
pub use lock::{AdvisoryLock, InProcessAdvisoryLock, LockGuard, LockKey};
pub use rebuild::{ProjectionRebuilder, RebuildError, RebuildMode, RebuildOutcome};
pub use registry::{ProjectionRegistration, ProjectionStatus, ProjectionType};

/// A read model fed by messages.
#[async_trait]
pub trait ProjectionDefinition: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u32 {
        1
    }

    /// Free-form label stored with the registration (e.g. `"sql"`).
    fn kind(&self) -> &str {
        "sql"
    }

    /// Message types this projection consumes.
    fn can_handle(&self) -> &[&'static str];

    fn handles(&self, message_type: &str) -> bool {
        self.can_handle().iter().any(|t| *t == message_type)
    }

    /// Create the projection's storage. Must be idempotent.
    async fn init(&self, _tx: &mut dyn SqlTransaction) -> anyhow::Result<()> {
        Ok(())
    }

    /// Apply messages, all of which satisfy [`ProjectionDefinition::handles`].
    async fn handle(
        &self,
        messages: &[RecordedMessage],
        tx: &mut dyn SqlTransaction,
    ) -> anyhow::Result<()>;

    /// Drop all projected state ahead of a rebuild.
    async fn truncate(&self, tx: &mut dyn SqlTransaction) -> anyhow::Result<()>;
}

/// Checkpoint id of the processor that runs a projection asynchronously.
pub fn projection_processor_id(name: &str) -> String {
    format!("projection:{name}")
}
