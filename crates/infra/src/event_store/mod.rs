//! Append-only message log.
//!
//! Streams hold ordered messages keyed by `(stream_id, partition)`; every
//! message also receives a log-wide `global_position` that consumers replay by.
//! The log never raises for the optimistic-concurrency path: a stale expected
//! version comes back as [`AppendResult::Failure`].

pub mod log;
pub mod types;

pub use log::EventLog;
pub use types::{
    AggregateStreamOptions, AggregateStreamResult, AppendFailure, AppendOptions, AppendResult,
    AppendSuccess, EventStore, EventStoreError, MessageBatch, PreCommitHook, ReadStreamOptions,
    ReadStreamResult, Upcaster,
};
