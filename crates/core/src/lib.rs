//! `eventline-core`: value types of the append-only message log.
//!
//! This crate contains **pure** primitives (no storage or async concerns).

pub mod error;
pub mod id;
pub mod message;
pub mod position;
pub mod version;

pub use error::{CoreError, CoreResult, VersionConflict};
pub use id::{MessageId, ProcessorInstanceId};
pub use message::{DEFAULT_PARTITION, Message, MessageKind, RecordedMessage};
pub use position::{CheckpointToken, GlobalPosition, ProcessorStartFrom, StartFrom};
pub use version::ExpectedVersion;
