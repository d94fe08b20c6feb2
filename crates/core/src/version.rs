//! Stream versions and optimistic concurrency expectations.

use serde::{Deserialize, Serialize};

use crate::error::VersionConflict;

/// Optimistic concurrency expectation for a stream append or read.
///
/// The stream version is the number of live messages in the stream, so a
/// stream that was never appended to is at version `0` and does not exist.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "version")]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require that the stream has no messages yet.
    NoStream,
    /// Require that the stream has at least one message.
    StreamExists,
    /// Require the stream to be at an exact version.
    Exact(u64),
}

impl Default for ExpectedVersion {
    fn default() -> Self {
        Self::Any
    }
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64, stream_exists: bool) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => !stream_exists,
            ExpectedVersion::StreamExists => stream_exists,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64, stream_exists: bool) -> Result<(), VersionConflict> {
        if self.matches(actual, stream_exists) {
            Ok(())
        } else {
            Err(VersionConflict {
                expected: self,
                actual,
                stream_exists,
            })
        }
    }

    /// The version the conditional write compares against.
    ///
    /// Sentinels resolve to the stored version, which the caller read inside
    /// the same transaction.
    pub fn resolve(self, current: u64) -> u64 {
        match self {
            ExpectedVersion::Exact(v) => v,
            _ => current,
        }
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::NoStream => f.write_str("no_stream"),
            ExpectedVersion::StreamExists => f.write_str("stream_exists"),
            ExpectedVersion::Exact(v) => write!(f, "{v}"),
        }
    }
}

impl From<u64> for ExpectedVersion {
    fn from(value: u64) -> Self {
        Self::Exact(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_match_on_existence() {
        assert!(ExpectedVersion::Any.matches(0, false));
        assert!(ExpectedVersion::Any.matches(7, true));
        assert!(ExpectedVersion::NoStream.matches(0, false));
        assert!(!ExpectedVersion::NoStream.matches(3, true));
        assert!(ExpectedVersion::StreamExists.matches(3, true));
        assert!(!ExpectedVersion::StreamExists.matches(0, false));
    }

    #[test]
    fn exact_reports_structured_conflict() {
        let err = ExpectedVersion::Exact(2).check(3, true).unwrap_err();
        assert_eq!(err.expected, ExpectedVersion::Exact(2));
        assert_eq!(err.actual, 3);
        assert!(err.stream_exists);
    }

    #[test]
    fn resolve_prefers_explicit_version() {
        assert_eq!(ExpectedVersion::Exact(4).resolve(9), 4);
        assert_eq!(ExpectedVersion::Any.resolve(9), 9);
        assert_eq!(ExpectedVersion::NoStream.resolve(0), 0);
    }
}
