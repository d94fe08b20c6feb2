use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use eventline_core::{
    CoreError, DEFAULT_PARTITION, ExpectedVersion, GlobalPosition, RecordedMessage,
    VersionConflict,
};

use crate::sql::{SqlError, SqlTransaction};

/// Event log operation error.
///
/// The optimistic-concurrency path of an append is *not* an error: it is
/// reported as [`AppendResult::Failure`]. `Concurrency` only surfaces from
/// [`AppendResult::into_result`] and from `aggregate_stream`'s re-check.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(#[from] VersionConflict),

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error("message serialization failed: {0}")]
    Serialization(String),

    #[error("pre-commit hook failed: {source:#}")]
    PreCommit {
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid append: {0}")]
    InvalidAppend(String),
}

impl From<CoreError> for EventStoreError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Conflict(conflict) => EventStoreError::Concurrency(conflict),
            other => EventStoreError::Serialization(other.to_string()),
        }
    }
}

/// Runs inside the append transaction after the messages are inserted.
///
/// Returning an error rolls the whole append back.
#[async_trait]
pub trait PreCommitHook: Send + Sync {
    async fn before_commit(
        &self,
        messages: &[RecordedMessage],
        tx: &mut dyn SqlTransaction,
    ) -> anyhow::Result<()>;
}

/// Rewrites recorded messages on every read path (schema evolution).
pub trait Upcaster: Send + Sync {
    fn upcast(&self, message: RecordedMessage) -> RecordedMessage;
}

impl<F> Upcaster for F
where
    F: Fn(RecordedMessage) -> RecordedMessage + Send + Sync,
{
    fn upcast(&self, message: RecordedMessage) -> RecordedMessage {
        self(message)
    }
}

#[derive(Clone)]
pub struct AppendOptions {
    pub expected_version: ExpectedVersion,
    pub partition: String,
    /// Ordered hooks, run after the log's own hooks.
    pub before_commit: Vec<Arc<dyn PreCommitHook>>,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            expected_version: ExpectedVersion::Any,
            partition: DEFAULT_PARTITION.to_string(),
            before_commit: Vec::new(),
        }
    }
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected_version(mut self, expected_version: impl Into<ExpectedVersion>) -> Self {
        self.expected_version = expected_version.into();
        self
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn before_commit(mut self, hook: Arc<dyn PreCommitHook>) -> Self {
        self.before_commit.push(hook);
        self
    }
}

impl std::fmt::Debug for AppendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendOptions")
            .field("expected_version", &self.expected_version)
            .field("partition", &self.partition)
            .field("before_commit", &self.before_commit.len())
            .finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AppendSuccess {
    /// Stream version after the append (position of its last message).
    pub next_expected_stream_version: u64,
    pub last_global_position: GlobalPosition,
    pub created_new_stream: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppendFailure {
    EmptyBatch,
    VersionMismatch(VersionConflict),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppendResult {
    Success(AppendSuccess),
    Failure(AppendFailure),
}

impl AppendResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AppendResult::Success(_))
    }

    /// Fold the structured failure into an error for `?` call sites.
    pub fn into_result(self) -> Result<AppendSuccess, EventStoreError> {
        match self {
            AppendResult::Success(success) => Ok(success),
            AppendResult::Failure(AppendFailure::EmptyBatch) => Err(EventStoreError::InvalidAppend(
                "cannot append an empty batch".to_string(),
            )),
            AppendResult::Failure(AppendFailure::VersionMismatch(conflict)) => {
                Err(EventStoreError::Concurrency(conflict))
            }
        }
    }
}

/// Stream read window. Positions are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStreamOptions {
    pub from: Option<u64>,
    pub to: Option<u64>,
    pub max_count: Option<u64>,
    pub partition: String,
}

impl Default for ReadStreamOptions {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            max_count: None,
            partition: DEFAULT_PARTITION.to_string(),
        }
    }
}

impl ReadStreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, from: u64) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: u64) -> Self {
        self.to = Some(to);
        self
    }

    pub fn max_count(mut self, max_count: u64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Inclusive upper bound combining `to` and `max_count`.
    pub(crate) fn upper_bound(&self) -> Option<u64> {
        let from = self.from.unwrap_or(1).max(1);
        let by_count = self
            .max_count
            .map(|count| from.saturating_add(count).saturating_sub(1));
        match (self.to, by_count) {
            (Some(to), Some(count)) => Some(to.min(count)),
            (Some(to), None) => Some(to),
            (None, count) => count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadStreamResult {
    pub messages: Vec<RecordedMessage>,
    /// 0 when the stream does not exist.
    pub current_stream_version: u64,
    pub stream_exists: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateStreamOptions {
    pub expected_version: ExpectedVersion,
    pub read: ReadStreamOptions,
}

impl AggregateStreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected_version(mut self, expected_version: impl Into<ExpectedVersion>) -> Self {
        self.expected_version = expected_version.into();
        self
    }

    pub fn read(mut self, read: ReadStreamOptions) -> Self {
        self.read = read;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateStreamResult<S> {
    pub state: S,
    pub current_stream_version: u64,
    pub stream_exists: bool,
}

/// Messages after a global position, in global order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBatch {
    pub messages: Vec<RecordedMessage>,
    /// Global position of the last message read, if any.
    pub last_position: Option<GlobalPosition>,
}

impl MessageBatch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Append/read boundary of the log.
///
/// `EventLog` is the SQL implementation; pullers and processors only depend
/// on this trait.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_to_stream(
        &self,
        stream_name: &str,
        stream_type: &str,
        messages: Vec<eventline_core::Message>,
        options: AppendOptions,
    ) -> Result<AppendResult, EventStoreError>;

    async fn read_stream(
        &self,
        stream_name: &str,
        options: ReadStreamOptions,
    ) -> Result<ReadStreamResult, EventStoreError>;

    async fn read_messages_batch(
        &self,
        after: GlobalPosition,
        batch_size: usize,
        partition: &str,
    ) -> Result<MessageBatch, EventStoreError>;

    async fn read_last_global_position(
        &self,
        partition: &str,
    ) -> Result<Option<GlobalPosition>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append_to_stream(
        &self,
        stream_name: &str,
        stream_type: &str,
        messages: Vec<eventline_core::Message>,
        options: AppendOptions,
    ) -> Result<AppendResult, EventStoreError> {
        (**self)
            .append_to_stream(stream_name, stream_type, messages, options)
            .await
    }

    async fn read_stream(
        &self,
        stream_name: &str,
        options: ReadStreamOptions,
    ) -> Result<ReadStreamResult, EventStoreError> {
        (**self).read_stream(stream_name, options).await
    }

    async fn read_messages_batch(
        &self,
        after: GlobalPosition,
        batch_size: usize,
        partition: &str,
    ) -> Result<MessageBatch, EventStoreError> {
        (**self).read_messages_batch(after, batch_size, partition).await
    }

    async fn read_last_global_position(
        &self,
        partition: &str,
    ) -> Result<Option<GlobalPosition>, EventStoreError> {
        (**self).read_last_global_position(partition).await
    }
}
