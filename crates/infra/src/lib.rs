//! `eventline-infra`: storage and processing for the message log.
//!
//! - [`event_store`]: the append-only log with optimistic concurrency
//! - [`checkpoints`]: compare-and-swap processor checkpoints
//! - [`consumers`]: batch puller, reactors/projectors and the consumer that drives them
//! - [`projections`]: projection definitions, inline application, locks and rebuilds
//! - [`sql`]: the narrow executor boundary with SQLite and Postgres adapters

pub mod checkpoints;
pub mod config;
pub mod consumers;
pub mod event_store;
pub mod projections;
pub mod retry;
pub mod sql;

pub use config::{EventlineConfig, connect};
pub use consumers::{
    Consumer, ConsumerError, ConsumerOptions, MessageHandler, MessageHandlerResult, Processor,
    ProcessorHandle, ProcessorOptions,
};
pub use event_store::{
    AggregateStreamOptions, AppendOptions, AppendResult, EventLog, EventStore, EventStoreError,
    ReadStreamOptions,
};
pub use projections::{
    InlineProjections, ProjectionDefinition, ProjectionRebuilder, ProjectionStatus, RebuildError,
};
pub use retry::RetryPolicy;
pub use sql::{SqlExecutor, SqlTransaction};
