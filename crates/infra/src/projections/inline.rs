//! Inline projections: applied inside the append transaction.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use eventline_core::RecordedMessage;

use super::ProjectionDefinition;
use super::registry::{self, ProjectionStatus, ProjectionType};
use crate::event_store::PreCommitHook;
use crate::sql::{SqlError, SqlExecutor, SqlTransaction};

/// Pre-commit hook applying a set of projections to every append.
///
/// A projection whose registration is `async_processing` is skipped: a rebuild
/// owns its state until it flips the status back to `active`, and will pick
/// the skipped messages up from the log. The status is read with
/// [`registry::read_projection_shared`], so that flip waits for every append
/// that already decided to skip.
#[derive(Clone, Default)]
pub struct InlineProjections {
    projections: Vec<Arc<dyn ProjectionDefinition>>,
}

impl InlineProjections {
    pub fn new(projections: Vec<Arc<dyn ProjectionDefinition>>) -> Self {
        Self { projections }
    }

    pub fn with(mut self, projection: Arc<dyn ProjectionDefinition>) -> Self {
        self.projections.push(projection);
        self
    }

    pub fn projections(&self) -> &[Arc<dyn ProjectionDefinition>] {
        &self.projections
    }

    /// Create storage for and register every projection in `partition`.
    #[instrument(skip(self, executor), fields(projections = self.projections.len()), err)]
    pub async fn register(&self, executor: &dyn SqlExecutor, partition: &str) -> Result<(), SqlError> {
        let mut tx = executor.begin().await?;
        for projection in &self.projections {
            projection.init(tx.as_mut()).await.map_err(|e| SqlError::Other {
                operation: "init_projection".to_string(),
                message: format!("{}: {e:#}", projection.name()),
            })?;
            registry::register_projection(tx.as_mut(), projection.as_ref(), partition, ProjectionType::Inline)
                .await?;
        }
        tx.commit().await
    }
}

impl std::fmt::Debug for InlineProjections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.projections.iter().map(|p| p.name().to_string()))
            .finish()
    }
}

#[async_trait]
impl PreCommitHook for InlineProjections {
    async fn before_commit(
        &self,
        messages: &[RecordedMessage],
        tx: &mut dyn SqlTransaction,
    ) -> anyhow::Result<()> {
        let Some(partition) = messages.first().map(|m| m.partition.as_str()) else {
            return Ok(());
        };

        for projection in &self.projections {
            let relevant: Vec<RecordedMessage> = messages
                .iter()
                .filter(|m| projection.handles(&m.message_type))
                .cloned()
                .collect();
            if relevant.is_empty() {
                continue;
            }

            let registration =
                registry::read_projection_shared(&mut *tx, projection.name(), partition, projection.version())
                    .await?;
            if registration.is_some_and(|r| r.status == ProjectionStatus::AsyncProcessing) {
                debug!(projection = projection.name(), "rebuild in progress, skipping inline apply");
                continue;
            }

            projection.handle(&relevant, &mut *tx).await?;
        }
        Ok(())
    }
}
