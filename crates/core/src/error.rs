//! Core error model.

use thiserror::Error;

use crate::version::ExpectedVersion;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Keep this focused on deterministic failures of the log's value types
/// (tokens, encodings, version checks). Storage concerns belong to the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A checkpoint token could not be parsed.
    #[error("invalid checkpoint token: {0}")]
    InvalidCheckpoint(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A typed event could not be encoded into a message.
    #[error("event encoding failed: {0}")]
    Encoding(String),

    /// A recorded message could not be decoded into a typed event.
    #[error("event decoding failed: {0}")]
    Decoding(String),

    /// The stream was not at the expected version.
    #[error(transparent)]
    Conflict(#[from] VersionConflict),
}

impl CoreError {
    pub fn invalid_checkpoint(msg: impl Into<String>) -> Self {
        Self::InvalidCheckpoint(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub fn decoding(msg: impl Into<String>) -> Self {
        Self::Decoding(msg.into())
    }
}

/// Structured optimistic-concurrency failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("expected stream version {expected}, found {actual} (stream exists: {stream_exists})")]
pub struct VersionConflict {
    pub expected: ExpectedVersion,
    pub actual: u64,
    pub stream_exists: bool,
}
